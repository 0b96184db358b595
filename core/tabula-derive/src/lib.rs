//! Procedural macros for tabula.
//!
//! Provides `#[derive(Entity)]` for declared entity bindings,
//! `#[derive(Record)]` for structural records and `#[derive(SqlEnum)]` for
//! enums stored under their symbolic names.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::spanned::Spanned;
use syn::{
    Data, DeriveInput, Field, Fields, GenericArgument, LitStr, Path, PathArguments, Type,
    parse_macro_input,
};

/// Derive macro for entity bindings.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Default, Entity)]
/// #[tabula(table = "orders", post_load = "Order::after_load")]
/// pub struct Order {
///     #[tabula(id, generated)]
///     pub id: Option<i64>,
///     #[tabula(column = "total_cents")]
///     pub total: i64,
///     #[tabula(relation, column = "customer_id", prefix = "customer_")]
///     pub customer: Option<Ref<Customer>>,
///     #[tabula(skip)]
///     pub dirty: bool,
/// }
/// ```
///
/// Field attributes:
/// - `id`: part of the identity; `generated` also implies `id`
/// - `column = "..."`: column name (default: the field name, or
///   `<field>_id` for relations)
/// - `relation`: an `Option<Ref<T>>` foreign key; `prefix = "..."` names the
///   row columns copied into the stub (default `<field>_`)
/// - `skip`: not bound
#[proc_macro_derive(Entity, attributes(tabula))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_entity(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Derive macro for structural records (named or tuple structs).
///
/// Each field is a component: a scalar, an `Option` of a scalar, or another
/// record. Components are read in declaration order.
#[proc_macro_derive(Record)]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_record(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Derive macro for unit-only enums stored as text.
///
/// Variants are stored under their own name unless renamed with
/// `#[tabula(rename = "...")]`.
#[proc_macro_derive(SqlEnum, attributes(tabula))]
pub fn derive_sql_enum(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_sql_enum(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

// ===== Entity =====

#[derive(Default)]
struct EntityAttrs {
    table: Option<String>,
    post_load: Option<Path>,
    post_store: Option<Path>,
}

#[derive(Default)]
struct FieldAttrs {
    id: bool,
    generated: bool,
    column: Option<String>,
    relation: bool,
    prefix: Option<String>,
    skip: bool,
}

fn entity_attrs(input: &DeriveInput) -> syn::Result<EntityAttrs> {
    let mut attrs = EntityAttrs::default();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("tabula")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                attrs.table = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("post_load") {
                attrs.post_load = Some(meta.value()?.parse::<LitStr>()?.parse()?);
            } else if meta.path.is_ident("post_store") {
                attrs.post_store = Some(meta.value()?.parse::<LitStr>()?.parse()?);
            } else {
                return Err(meta.error("expected `table`, `post_load` or `post_store`"));
            }
            Ok(())
        })?;
    }
    Ok(attrs)
}

fn field_attrs(field: &Field) -> syn::Result<FieldAttrs> {
    let mut attrs = FieldAttrs::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("tabula")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("id") {
                attrs.id = true;
            } else if meta.path.is_ident("generated") {
                attrs.id = true;
                attrs.generated = true;
            } else if meta.path.is_ident("relation") {
                attrs.relation = true;
            } else if meta.path.is_ident("skip") {
                attrs.skip = true;
            } else if meta.path.is_ident("column") {
                attrs.column = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.path.is_ident("prefix") {
                attrs.prefix = Some(meta.value()?.parse::<LitStr>()?.value());
            } else {
                return Err(meta.error(
                    "expected `id`, `generated`, `column`, `relation`, `prefix` or `skip`",
                ));
            }
            Ok(())
        })?;
    }
    if attrs.relation && attrs.id {
        return Err(syn::Error::new(
            field.span(),
            "a relation cannot be part of the identity",
        ));
    }
    if attrs.prefix.is_some() && !attrs.relation {
        return Err(syn::Error::new(field.span(), "`prefix` requires `relation`"));
    }
    Ok(attrs)
}

fn expand_entity(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let attrs = entity_attrs(input)?;
    let Some(table) = attrs.table else {
        return Err(syn::Error::new(
            name.span(),
            "Entity requires #[tabula(table = \"...\")]",
        ));
    };

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new(
                    name.span(),
                    "Entity can only be derived for structs with named fields",
                ));
            }
        },
        _ => return Err(syn::Error::new(name.span(), "Entity can only be derived for structs")),
    };

    let mut columns = Vec::new();
    for field in fields {
        let attrs = field_attrs(field)?;
        if attrs.skip {
            continue;
        }
        let Some(ident) = &field.ident else {
            continue;
        };

        let column = if attrs.relation {
            let target = ref_target(&field.ty).ok_or_else(|| {
                syn::Error::new(field.ty.span(), "relation fields must be `Option<Ref<T>>`")
            })?;
            let column = attrs.column.unwrap_or_else(|| format!("{ident}_id"));
            let prefix = attrs.prefix.unwrap_or_else(|| format!("{ident}_"));
            quote! {
                ::tabula_core::entity::ColumnBinding::<Self>::relation::<#target>(
                    #column,
                    #prefix,
                    |e: &Self| e.#ident.as_ref(),
                    |e: &mut Self, r: ::std::option::Option<::tabula_core::entity::Ref<#target>>| {
                        e.#ident = r;
                    },
                )
            }
        } else {
            let column = attrs.column.unwrap_or_else(|| ident.to_string());
            let binding = quote! {
                ::tabula_core::entity::ColumnBinding::<Self>::try_new(
                    #column,
                    |e: &Self| ::tabula_core::value::TryIntoValue::try_into_value(
                        ::std::clone::Clone::clone(&e.#ident),
                    ),
                    |e: &mut Self, v: &::tabula_core::value::Value| {
                        e.#ident = ::tabula_core::value::FromValue::from_value(v)?;
                        ::std::result::Result::Ok(())
                    },
                )
            };
            if attrs.generated {
                quote! { #binding.generated() }
            } else if attrs.id {
                quote! { #binding.identity() }
            } else {
                binding
            }
        };
        columns.push(column);
    }

    let post_load = attrs.post_load.map(|path| quote! { .post_load(#path) });
    let post_store = attrs.post_store.map(|path| quote! { .post_store(#path) });
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::tabula_core::entity::Entity for #name #ty_generics #where_clause {
            fn descriptor() -> ::tabula_core::entity::EntityDescriptor<Self> {
                ::tabula_core::entity::EntityDescriptor::new()
                    .table(#table)
                    #(.column(#columns))*
                    #post_load
                    #post_store
            }
        }
    })
}

/// `T` of `Option<Ref<T>>`.
fn ref_target(ty: &Type) -> Option<&Type> {
    let inner = single_generic(ty, "Option")?;
    single_generic(inner, "Ref")
}

fn single_generic<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

// ===== Record =====

fn expand_record(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let label = name.to_string();
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "Record can only be derived for structs"));
    };

    let types: Vec<&Type> = data.fields.iter().map(|f| &f.ty).collect();
    let construct = match &data.fields {
        Fields::Named(fields) => {
            let reads = fields.named.iter().map(|f| {
                let ident = &f.ident;
                let ty = &f.ty;
                quote! { #ident: <#ty as ::tabula_core::reflect::Component>::read(reader)? }
            });
            quote! { Self { #(#reads),* } }
        }
        Fields::Unnamed(fields) => {
            let reads = fields.unnamed.iter().map(|f| {
                let ty = &f.ty;
                quote! { <#ty as ::tabula_core::reflect::Component>::read(reader)? }
            });
            quote! { Self(#(#reads),*) }
        }
        Fields::Unit => {
            return Err(syn::Error::new(name.span(), "Record needs at least one component"));
        }
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::tabula_core::reflect::Component for #name #ty_generics #where_clause {
            fn shape() -> ::tabula_core::reflect::Shape {
                ::tabula_core::reflect::Shape::record(
                    #label,
                    ::std::vec![#(<#types as ::tabula_core::reflect::Component>::shape()),*],
                )
            }

            fn read(
                reader: &mut ::tabula_core::reflect::ValueReader<'_>,
            ) -> ::tabula_core::error::TabulaResult<Self> {
                ::std::result::Result::Ok(#construct)
            }
        }

        impl #impl_generics ::tabula_core::reflect::Record for #name #ty_generics #where_clause {}
    })
}

// ===== SqlEnum =====

fn expand_sql_enum(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new(name.span(), "SqlEnum can only be derived for enums"));
    };
    if data.variants.is_empty() {
        return Err(syn::Error::new(name.span(), "SqlEnum needs at least one variant"));
    }

    let mut idents = Vec::new();
    let mut names = Vec::new();
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new(
                variant.span(),
                "SqlEnum variants cannot carry data",
            ));
        }
        let mut rename = None;
        for attr in variant.attrs.iter().filter(|a| a.path().is_ident("tabula")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    rename = Some(meta.value()?.parse::<LitStr>()?.value());
                    Ok(())
                } else {
                    Err(meta.error("expected `rename`"))
                }
            })?;
        }
        let sql_name = rename.unwrap_or_else(|| variant.ident.to_string());
        if names.contains(&sql_name) {
            return Err(syn::Error::new(
                variant.span(),
                format!("duplicate SQL name '{sql_name}'"),
            ));
        }
        idents.push(&variant.ident);
        names.push(sql_name);
    }

    Ok(quote! {
        impl ::tabula_core::value::SqlEnum for #name {
            fn sql_name(&self) -> &'static str {
                match self {
                    #(Self::#idents => #names,)*
                }
            }

            fn from_sql_name(name: &str) -> ::std::option::Option<Self> {
                match name {
                    #(#names => ::std::option::Option::Some(Self::#idents),)*
                    _ => ::std::option::Option::None,
                }
            }
        }

        impl ::tabula_core::value::IntoValue for #name {
            fn into_value(self) -> ::tabula_core::value::Value {
                ::tabula_core::value::Value::Text(
                    ::tabula_core::value::SqlEnum::sql_name(&self).to_string(),
                )
            }
        }

        impl ::tabula_core::value::FromValue for #name {
            fn from_value(
                value: &::tabula_core::value::Value,
            ) -> ::tabula_core::error::TabulaResult<Self> {
                <Self as ::tabula_core::value::SqlEnum>::decode_sql_name(value)
            }
        }

        impl ::tabula_core::reflect::Component for #name {
            fn shape() -> ::tabula_core::reflect::Shape {
                ::tabula_core::reflect::Shape::Leaf(::tabula_core::reflect::LeafType::required(
                    ::tabula_core::value::ValueType::Text,
                ))
            }

            fn read(
                reader: &mut ::tabula_core::reflect::ValueReader<'_>,
            ) -> ::tabula_core::error::TabulaResult<Self> {
                reader.read()
            }
        }
    })
}
