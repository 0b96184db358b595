//! #[derive(Record)] and #[derive(SqlEnum)] with reflectors

use tabula_core::reflect::{Component, Reflector, Shape};
use tabula_core::{FromValue, IntoValue, Record, SqlEnum, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, SqlEnum)]
enum Unit {
    #[tabula(rename = "m")]
    Meters,
    #[tabula(rename = "ft")]
    Feet,
}

#[derive(Debug, PartialEq, Record)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Debug, PartialEq, Record)]
struct Segment(Point, Point);

#[derive(Debug, PartialEq, Record)]
struct Measured {
    segment: Segment,
    unit: Unit,
    note: Option<String>,
}

#[test]
fn test_shape_is_nested() {
    let Shape::Record { name, components } = Segment::shape() else {
        panic!("expected a record shape");
    };
    assert_eq!(name, "Segment");
    assert_eq!(components.len(), 2);
    assert_eq!(Segment::shape().leaf_count(), 4);
    assert_eq!(Measured::shape().leaf_count(), 6);
}

#[test]
fn test_mapper_reads_nested_records() {
    let reflector =
        Reflector::of::<Measured>(&["ax", "ay", "bx", "by", "unit", "note"]).unwrap();
    let mapper = reflector.mapper::<Measured>().unwrap();
    let measured = mapper
        .map_values(&[
            Value::Float64(0.0),
            Value::Float64(1.0),
            Value::Float64(2.0),
            Value::Float64(3.0),
            Value::Text("ft".into()),
            Value::Null,
        ])
        .unwrap();

    assert_eq!(measured.segment.1, Point { x: 2.0, y: 3.0 });
    assert_eq!(measured.unit, Unit::Feet);
    assert_eq!(measured.note, None);
}

#[test]
fn test_projection_onto_smaller_record() {
    let reflector = Reflector::of::<Segment>(&["ax", "ay", "bx", "by"])
        .unwrap()
        .only(&["bx", "by"])
        .unwrap();
    let mapper = reflector.mapper::<Point>().unwrap();
    assert_eq!(mapper.columns(), vec!["bx", "by"]);
    assert_eq!(
        mapper
            .map_values(&[Value::Float64(5.0), Value::Float64(6.0)])
            .unwrap(),
        Point { x: 5.0, y: 6.0 }
    );
}

#[test]
fn test_enum_names() {
    assert_eq!(Unit::Meters.sql_name(), "m");
    assert_eq!(Unit::Feet.into_value(), Value::Text("ft".into()));
    assert_eq!(Unit::from_value(&Value::Text("m".into())).unwrap(), Unit::Meters);
    assert!(Unit::from_value(&Value::Text("Meters".into())).is_err());
    assert!(Unit::from_value(&Value::Int32(1)).is_err());
    assert_eq!(
        Option::<Unit>::from_value(&Value::Null).unwrap(),
        None
    );
}
