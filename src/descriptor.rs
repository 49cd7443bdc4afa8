use std::fmt::{self, Display, Formatter};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_until,
    character::complete::{char, one_of},
    combinator::{all_consuming, map, value},
    multi::many0,
    sequence::delimited,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor(pub(crate) FieldType);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub(crate) parameters: Vec<FieldType>,
    pub(crate) return_type: ReturnType,
}

pub type ReturnType = Option<FieldType>;

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum FieldType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Object(String),
    Short,
    Boolean,
    Array(Box<FieldType>),
}

impl FieldType {
    /// Long and double occupy two 32-bit slots.
    pub fn is_long(&self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }

    pub fn slot_size(&self) -> usize {
        if self.is_long() { 2 } else { 1 }
    }

    pub fn is_primitive(&self) -> bool {
        !self.is_reference()
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Object(_) | FieldType::Array(_))
    }

    pub fn to_descriptor(&self) -> String {
        let mut out = String::new();
        self.write_descriptor(&mut out);
        out
    }

    fn write_descriptor(&self, out: &mut String) {
        match self {
            FieldType::Byte => out.push('B'),
            FieldType::Char => out.push('C'),
            FieldType::Double => out.push('D'),
            FieldType::Float => out.push('F'),
            FieldType::Int => out.push('I'),
            FieldType::Long => out.push('J'),
            FieldType::Short => out.push('S'),
            FieldType::Boolean => out.push('Z'),
            FieldType::Object(name) => {
                out.push('L');
                out.push_str(name);
                out.push(';');
            }
            FieldType::Array(element) => {
                out.push('[');
                element.write_descriptor(out);
            }
        }
    }

    /// The name a class descriptor for this type carries: `java/lang/String` for objects,
    /// `[I` for arrays and the language keyword for primitives.
    pub fn class_name(&self) -> String {
        match self {
            FieldType::Object(name) => name.clone(),
            FieldType::Array(_) => self.to_descriptor(),
            FieldType::Byte => "byte".to_string(),
            FieldType::Char => "char".to_string(),
            FieldType::Double => "double".to_string(),
            FieldType::Float => "float".to_string(),
            FieldType::Int => "int".to_string(),
            FieldType::Long => "long".to_string(),
            FieldType::Short => "short".to_string(),
            FieldType::Boolean => "boolean".to_string(),
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_descriptor())
    }
}

impl MethodDescriptor {
    /// Number of operand slots the arguments take, not counting a receiver.
    pub fn param_slots(&self) -> usize {
        self.parameters.iter().map(FieldType::slot_size).sum()
    }

    pub fn return_slots(&self) -> usize {
        self.return_type.as_ref().map(FieldType::slot_size).unwrap_or(0)
    }
}

impl Display for MethodDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for parameter in &self.parameters {
            Display::fmt(parameter, f)?;
        }
        f.write_str(")")?;
        match &self.return_type {
            Some(return_type) => Display::fmt(return_type, f),
            None => f.write_str("V"),
        }
    }
}

pub fn parse_field_descriptor(input: &str) -> IResult<&str, FieldDescriptor> {
    map(all_consuming(parse_field_type), FieldDescriptor).parse(input)
}

pub fn parse_method_descriptor(input: &str) -> IResult<&str, MethodDescriptor> {
    let (input, parameters) =
        delimited(char('('), many0(parse_field_type), char(')')).parse(input)?;

    let (input, return_type) = all_consuming(parse_return_type_descriptor).parse(input)?;

    Ok((
        input,
        MethodDescriptor {
            parameters,
            return_type,
        },
    ))
}

pub fn parse_return_type_descriptor(input: &str) -> IResult<&str, ReturnType> {
    alt((map(parse_field_type, Some), parse_void_type)).parse(input)
}

fn parse_field_type(input: &str) -> IResult<&str, FieldType> {
    alt((parse_base_type, parse_object_type, parse_array_type)).parse(input)
}

fn parse_base_type(input: &str) -> IResult<&str, FieldType> {
    map(one_of("BCDFIJSZ"), |ch| match ch {
        'B' => FieldType::Byte,
        'C' => FieldType::Char,
        'D' => FieldType::Double,
        'F' => FieldType::Float,
        'I' => FieldType::Int,
        'J' => FieldType::Long,
        'S' => FieldType::Short,
        _ => FieldType::Boolean,
    })
    .parse(input)
}

fn parse_object_type(input: &str) -> IResult<&str, FieldType> {
    map(delimited(char('L'), take_until(";"), char(';')), |name: &str| {
        FieldType::Object(name.to_string())
    })
    .parse(input)
}

fn parse_array_type(input: &str) -> IResult<&str, FieldType> {
    let (input, _) = char('[').parse(input)?;

    let (input, field_type) = parse_field_type(input)?;

    Ok((input, FieldType::Array(Box::new(field_type))))
}

fn parse_void_type(input: &str) -> IResult<&str, Option<FieldType>> {
    value(None, char('V')).parse(input)
}

/// Parses a class name as it appears in a `CONSTANT_Class` entry: either a binary name
/// (`java/lang/Object`) or an array descriptor (`[I`).
pub fn class_name_to_field_type(name: &str) -> Option<FieldType> {
    if name.starts_with('[') {
        parse_field_descriptor(name).ok().map(|(_, FieldDescriptor(t))| t)
    } else if name.is_empty() || name.contains(';') {
        None
    } else {
        Some(FieldType::Object(name.to_string()))
    }
}
