//! External term format: the self-describing binary encoding Erlang nodes use
//! for every value they exchange.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt as _};

pub mod consts;
mod decode;
mod identity;

pub use decode::{decode, decode_prefix, decode_with_depth, DecodeError, DEFAULT_MAX_DEPTH};
pub use identity::{Pid, Port, Reference};

use consts::{tag, MAX_ATOM_CHARS, MAX_STRING_EXT_LEN, NEW_PORT_ID_MAX, VERSION_TAG};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("atom of {0} characters exceeds the limit of 255")]
pub struct AtomTooLong(pub usize);

impl Atom {
    /// # Panics
    ///
    /// If `name` is longer than 255 characters. Use [`Atom::try_new`] for
    /// text that is not known to fit.
    pub fn new(name: impl Into<String>) -> Self {
        match Atom::try_new(name) {
            Ok(atom) => atom,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_new(name: impl Into<String>) -> Result<Self, AtomTooLong> {
        let name = name.into();
        let chars = name.chars().count();
        if chars > MAX_ATOM_CHARS {
            return Err(AtomTooLong(chars));
        }
        Ok(Atom(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Atom::new(name)
    }
}

impl From<String> for Atom {
    fn from(name: String) -> Self {
        Atom::new(name)
    }
}

impl PartialEq<str> for Atom {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:?}", self.0)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arbitrary precision integer as sent on the wire: a sign and a
/// little-endian magnitude.
#[derive(Debug, Clone)]
pub struct BigInt {
    pub negative: bool,
    pub digits: Vec<u8>,
}

impl BigInt {
    pub fn from_i128(value: i128) -> Self {
        let mut magnitude = value.unsigned_abs();
        let mut digits = Vec::with_capacity(16);
        while magnitude > 0 {
            digits.push((magnitude & 0xff) as u8);
            magnitude >>= 8;
        }
        BigInt {
            negative: value < 0,
            digits,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_i128(value.into())
    }

    fn significant_digits(&self) -> &[u8] {
        let len = self
            .digits
            .iter()
            .rposition(|d| *d != 0)
            .map_or(0, |pos| pos + 1);
        &self.digits[..len]
    }

    pub fn is_zero(&self) -> bool {
        self.significant_digits().is_empty()
    }

    /// Returns `None` when the value does not fit in an `i128`.
    pub fn to_i128(&self) -> Option<i128> {
        let digits = self.significant_digits();
        if digits.len() > 16 {
            return None;
        }
        let magnitude = digits
            .iter()
            .enumerate()
            .fold(0u128, |acc, (i, d)| acc | (u128::from(*d) << (8 * i)));
        if self.negative {
            if magnitude > i128::MAX as u128 + 1 {
                None
            } else {
                Some((magnitude as i128).wrapping_neg())
            }
        } else {
            i128::try_from(magnitude).ok()
        }
    }
}

impl PartialEq for BigInt {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.significant_digits(), other.significant_digits());
        a == b && (a.is_empty() || self.negative == other.negative)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fun {
    pub arity: u8,
    pub uniq: [u8; 16],
    pub index: u32,
    pub module: Atom,
    pub old_index: Term,
    pub old_uniq: Term,
    pub pid: Pid,
    pub free_vars: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub module: Atom,
    pub function: Atom,
    pub arity: u8,
}

/// A dynamically typed Erlang value.
///
/// Each variant corresponds to one family of wire tags. Build values through
/// the constructors (`Term::list`, `Term::map`, `Term::from(i64)`, ...) to get
/// the canonical shape the decoder produces.
#[derive(Clone)]
pub enum Term {
    // Terminals
    Integer(i32),
    BigInt(BigInt),
    Float(f64),
    Atom(Atom),
    Binary(Vec<u8>),
    BitString { data: Vec<u8>, bits: u8 },

    // Identities
    Pid(Pid),
    Port(Port),
    Reference(Reference),

    // Functions
    Fun(Box<Fun>),
    Export(Box<Export>),

    // Compounds
    Tuple(Vec<Term>),
    Map(Vec<(Term, Term)>),
    Nil,
    /// A proper list whose elements are all integers in `0..=255`.
    String(Vec<u8>),
    /// Elements plus tail; the list is proper when the tail is `Nil`.
    List(Vec<Term>, Box<Term>),
}

static NIL: Term = Term::Nil;

impl Term {
    pub fn atom(name: impl Into<Atom>) -> Term {
        Term::Atom(name.into())
    }

    pub fn boolean(value: bool) -> Term {
        Term::atom(if value { "true" } else { "false" })
    }

    pub fn tuple(elements: Vec<Term>) -> Term {
        Term::Tuple(elements)
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Term {
        Term::Binary(data.into())
    }

    /// A bitstring whose last byte carries `bits` significant bits. Whole-byte
    /// values collapse to a binary.
    pub fn bitstring(data: Vec<u8>, bits: u8) -> Term {
        if bits == 8 || data.is_empty() {
            Term::Binary(data)
        } else {
            Term::BitString { data, bits }
        }
    }

    /// A proper list. Empty lists become `Nil` and byte-valued lists become
    /// `String`.
    pub fn list(elements: Vec<Term>) -> Term {
        if elements.is_empty() {
            Term::Nil
        } else if let Some(bytes) = string_bytes(&elements) {
            Term::String(bytes)
        } else {
            Term::List(elements, Box::new(Term::Nil))
        }
    }

    pub fn improper_list(elements: Vec<Term>, tail: Term) -> Term {
        if tail.is_nil() {
            Term::list(elements)
        } else if elements.is_empty() {
            tail
        } else {
            Term::List(elements, Box::new(tail))
        }
    }

    /// A list of unicode codepoints, like an Erlang charlist.
    pub fn charlist(text: &str) -> Term {
        Term::list(
            text.chars()
                .map(|c| Term::Integer(u32::from(c) as i32))
                .collect(),
        )
    }

    /// Builds a map keeping insertion order. A repeated key overwrites the
    /// earlier value in place.
    pub fn map(entries: impl IntoIterator<Item = (Term, Term)>) -> Term {
        let mut pairs: Vec<(Term, Term)> = Vec::new();
        let mut slots: HashMap<Vec<u8>, usize> = HashMap::new();
        for (key, value) in entries {
            let identity = key.encode();
            match slots.get(&identity) {
                Some(&slot) => pairs[slot].1 = value,
                None => {
                    slots.insert(identity, pairs.len());
                    pairs.push((key, value));
                }
            }
        }
        Term::Map(pairs)
    }

    pub fn is_nil(&self) -> bool {
        match self {
            Term::Nil => true,
            Term::String(bytes) => bytes.is_empty(),
            Term::List(elements, tail) => elements.is_empty() && tail.is_nil(),
            _ => false,
        }
    }

    pub fn is_atom(&self, name: &str) -> bool {
        matches!(self, Term::Atom(atom) if atom.as_str() == name)
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match self {
            Term::Atom(atom) => Some(atom),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&Pid> {
        match self {
            Term::Pid(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Term::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Term::Binary(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Term::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer value of `Integer` and of any `BigInt` that fits in an `i64`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Term::Integer(value) => Some((*value).into()),
            Term::BigInt(big) => big.to_i128().and_then(|v| i64::try_from(v).ok()),
            _ => None,
        }
    }

    /// Encodes the term with the leading version tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_versioned(&mut buf)
            .expect("writing a term into memory cannot fail");
        buf
    }

    pub fn write_versioned(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_u8(VERSION_TAG)?;
        self.write(w)
    }

    /// Writes the term body (no version tag).
    pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
        match self {
            Term::Nil => w.write_u8(tag::NIL_EXT)?,
            Term::Integer(num) => {
                if (0..=255).contains(num) {
                    w.write_u8(tag::SMALL_INTEGER_EXT)?;
                    w.write_u8(*num as u8)?;
                } else {
                    w.write_u8(tag::INTEGER_EXT)?;
                    w.write_i32::<BigEndian>(*num)?;
                }
            }
            Term::BigInt(big) => {
                if let Some(small) = big.to_i128().and_then(|v| i32::try_from(v).ok()) {
                    return Term::Integer(small).write(w);
                }
                let digits = big.significant_digits();
                if digits.len() <= 255 {
                    w.write_u8(tag::SMALL_BIG_EXT)?;
                    w.write_u8(digits.len() as u8)?;
                } else {
                    w.write_u8(tag::LARGE_BIG_EXT)?;
                    w.write_u32::<BigEndian>(digits.len() as u32)?;
                }
                w.write_u8(u8::from(big.negative && !digits.is_empty()))?;
                w.write_all(digits)?;
            }
            Term::Float(num) => {
                w.write_u8(tag::NEW_FLOAT_EXT)?;
                w.write_f64::<BigEndian>(*num)?;
            }
            Term::Atom(atom) => write_atom(w, atom)?,
            Term::Binary(data) => {
                w.write_u8(tag::BINARY_EXT)?;
                w.write_u32::<BigEndian>(data.len() as u32)?;
                w.write_all(data)?;
            }
            Term::BitString { data, bits } => {
                w.write_u8(tag::BIT_BINARY_EXT)?;
                w.write_u32::<BigEndian>(data.len() as u32)?;
                w.write_u8(*bits)?;
                w.write_all(data)?;
            }
            Term::Pid(pid) => {
                w.write_u8(tag::NEW_PID_EXT)?;
                write_atom(w, &pid.node)?;
                w.write_u32::<BigEndian>(pid.id)?;
                w.write_u32::<BigEndian>(pid.serial)?;
                w.write_u32::<BigEndian>(pid.creation)?;
            }
            Term::Port(port) => {
                if port.id > NEW_PORT_ID_MAX {
                    w.write_u8(tag::V4_PORT_EXT)?;
                    write_atom(w, &port.node)?;
                    w.write_u64::<BigEndian>(port.id)?;
                } else {
                    w.write_u8(tag::NEW_PORT_EXT)?;
                    write_atom(w, &port.node)?;
                    w.write_u32::<BigEndian>(port.id as u32)?;
                }
                w.write_u32::<BigEndian>(port.creation)?;
            }
            Term::Reference(reference) => {
                w.write_u8(tag::NEWER_REFERENCE_EXT)?;
                w.write_u16::<BigEndian>(reference.ids.len() as u16)?;
                write_atom(w, &reference.node)?;
                w.write_u32::<BigEndian>(reference.creation)?;
                for id in &reference.ids {
                    w.write_u32::<BigEndian>(*id)?;
                }
            }
            Term::Fun(fun) => {
                let mut body = Vec::new();
                body.write_u8(fun.arity)?;
                body.write_all(&fun.uniq)?;
                body.write_u32::<BigEndian>(fun.index)?;
                body.write_u32::<BigEndian>(fun.free_vars.len() as u32)?;
                write_atom(&mut body, &fun.module)?;
                fun.old_index.write(&mut body)?;
                fun.old_uniq.write(&mut body)?;
                Term::Pid(fun.pid.clone()).write(&mut body)?;
                for var in &fun.free_vars {
                    var.write(&mut body)?;
                }

                // The size field counts itself.
                w.write_u8(tag::NEW_FUN_EXT)?;
                w.write_u32::<BigEndian>(body.len() as u32 + 4)?;
                w.write_all(&body)?;
            }
            Term::Export(export) => {
                w.write_u8(tag::EXPORT_EXT)?;
                write_atom(w, &export.module)?;
                write_atom(w, &export.function)?;
                w.write_u8(tag::SMALL_INTEGER_EXT)?;
                w.write_u8(export.arity)?;
            }
            Term::Tuple(elements) => {
                if elements.len() <= 255 {
                    w.write_u8(tag::SMALL_TUPLE_EXT)?;
                    w.write_u8(elements.len() as u8)?;
                } else {
                    w.write_u8(tag::LARGE_TUPLE_EXT)?;
                    w.write_u32::<BigEndian>(elements.len() as u32)?;
                }
                for element in elements {
                    element.write(w)?;
                }
            }
            Term::Map(pairs) => {
                w.write_u8(tag::MAP_EXT)?;
                w.write_u32::<BigEndian>(pairs.len() as u32)?;
                for (key, value) in pairs {
                    key.write(w)?;
                    value.write(w)?;
                }
            }
            Term::String(bytes) => write_byte_list(w, bytes)?,
            Term::List(elements, tail) => {
                if elements.is_empty() {
                    tail.write(w)?;
                } else if let Some(bytes) = string_bytes(elements).filter(|_| tail.is_nil()) {
                    write_byte_list(w, &bytes)?;
                } else {
                    w.write_u8(tag::LIST_EXT)?;
                    w.write_u32::<BigEndian>(elements.len() as u32)?;
                    for element in elements {
                        element.write(w)?;
                    }
                    tail.write(w)?;
                }
            }
        }
        Ok(())
    }

    fn list_view(&self) -> Option<(ListElements<'_>, &Term)> {
        match self {
            Term::Nil => Some((ListElements::Bytes(&[]), &NIL)),
            Term::String(bytes) => Some((ListElements::Bytes(bytes), &NIL)),
            Term::List(elements, tail) => Some((ListElements::Terms(elements), tail)),
            _ => None,
        }
    }
}

fn string_bytes(elements: &[Term]) -> Option<Vec<u8>> {
    if elements.len() > MAX_STRING_EXT_LEN {
        return None;
    }
    elements
        .iter()
        .map(|element| match element {
            Term::Integer(v) => u8::try_from(*v).ok(),
            _ => None,
        })
        .collect()
}

fn write_atom(w: &mut impl Write, atom: &Atom) -> std::io::Result<()> {
    // At most 255 characters, so the byte length always fits in a u16.
    let text = atom.as_str().as_bytes();
    if text.len() <= 255 {
        w.write_u8(tag::SMALL_ATOM_UTF8_EXT)?;
        w.write_u8(text.len() as u8)?;
    } else {
        w.write_u8(tag::ATOM_UTF8_EXT)?;
        w.write_u16::<BigEndian>(text.len() as u16)?;
    }
    w.write_all(text)
}

fn write_byte_list(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    if bytes.is_empty() {
        w.write_u8(tag::NIL_EXT)
    } else if bytes.len() <= MAX_STRING_EXT_LEN {
        w.write_u8(tag::STRING_EXT)?;
        w.write_u16::<BigEndian>(bytes.len() as u16)?;
        w.write_all(bytes)
    } else {
        w.write_u8(tag::LIST_EXT)?;
        w.write_u32::<BigEndian>(bytes.len() as u32)?;
        for byte in bytes {
            w.write_u8(tag::SMALL_INTEGER_EXT)?;
            w.write_u8(*byte)?;
        }
        w.write_u8(tag::NIL_EXT)
    }
}

enum ListElements<'a> {
    Bytes(&'a [u8]),
    Terms(&'a [Term]),
}

impl ListElements<'_> {
    fn len(&self) -> usize {
        match self {
            ListElements::Bytes(bytes) => bytes.len(),
            ListElements::Terms(terms) => terms.len(),
        }
    }

    fn eq_at(&self, other: &Self, i: usize) -> bool {
        match (self, other) {
            (ListElements::Bytes(a), ListElements::Bytes(b)) => a[i] == b[i],
            (ListElements::Terms(a), ListElements::Terms(b)) => a[i] == b[i],
            (ListElements::Bytes(bytes), ListElements::Terms(terms))
            | (ListElements::Terms(terms), ListElements::Bytes(bytes)) => {
                matches!(terms[i], Term::Integer(v) if v == i32::from(bytes[i]))
            }
        }
    }
}

/// Structural equality, except that the three list shapes (`Nil`, `String`,
/// `List`) compare by their elements.
impl PartialEq for Term {
    fn eq(&self, other: &Term) -> bool {
        match (self, other) {
            (Term::Integer(a), Term::Integer(b)) => a == b,
            (Term::BigInt(a), Term::BigInt(b)) => a == b,
            (Term::Float(a), Term::Float(b)) => a == b,
            (Term::Atom(a), Term::Atom(b)) => a == b,
            (Term::Binary(a), Term::Binary(b)) => a == b,
            (
                Term::BitString { data: a, bits: x },
                Term::BitString { data: b, bits: y },
            ) => a == b && x == y,
            (Term::Pid(a), Term::Pid(b)) => a == b,
            (Term::Port(a), Term::Port(b)) => a == b,
            (Term::Reference(a), Term::Reference(b)) => a == b,
            (Term::Fun(a), Term::Fun(b)) => a == b,
            (Term::Export(a), Term::Export(b)) => a == b,
            (Term::Tuple(a), Term::Tuple(b)) => a == b,
            (Term::Map(a), Term::Map(b)) => a == b,
            (Term::Nil, Term::Nil) => true,
            _ => match (self.list_view(), other.list_view()) {
                (Some((a, a_tail)), Some((b, b_tail))) => {
                    a.len() == b.len()
                        && (0..a.len()).all(|i| a.eq_at(&b, i))
                        && a_tail == b_tail
                }
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Nil => write!(f, "[]"),
            Term::Integer(int) => write!(f, "{}", int),
            Term::BigInt(big) => match big.to_i128() {
                Some(value) => write!(f, "{}", value),
                None => write!(f, "{:?}", big),
            },
            Term::Float(flt) => write!(f, "{:?}", flt),
            Term::Atom(atom) => write!(f, "{:?}", atom),
            Term::Binary(data) => write!(f, "<<{:?}>>", data),
            Term::BitString { data, bits } => write!(f, "<<{:?}:{}>>", data, bits),
            Term::String(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Term::Pid(pid) => write!(f, "{:?}", pid),
            Term::Port(port) => write!(f, "{:?}", port),
            Term::Reference(reference) => write!(f, "{:?}", reference),
            Term::Fun(fun) => write!(
                f,
                "Fun(&{:?}.{}/{}, {:?}, {:?})",
                fun.module, fun.index, fun.arity, fun.pid, fun.free_vars
            ),
            Term::Export(export) => {
                write!(f, "&{:?}.{:?}/{}", export.module, export.function, export.arity)
            }
            Term::Tuple(elements) => f.debug_set().entries(elements).finish(),
            Term::Map(pairs) => f
                .debug_map()
                .entries(pairs.iter().map(|(k, v)| (k, v)))
                .finish(),
            Term::List(elements, tail) => {
                let mut list = f.debug_list();
                list.entries(elements.iter());
                if !tail.is_nil() {
                    list.entry(&**tail);
                }
                list.finish()
            }
        }
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Term::Integer(value)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInt(BigInt::from_i128(value.into())),
        }
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        match i32::try_from(value) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInt(BigInt::from_u64(value)),
        }
    }
}

impl From<i128> for Term {
    fn from(value: i128) -> Self {
        match i32::try_from(value) {
            Ok(small) => Term::Integer(small),
            Err(_) => Term::BigInt(BigInt::from_i128(value)),
        }
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Float(value)
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::boolean(value)
    }
}

impl From<Atom> for Term {
    fn from(atom: Atom) -> Self {
        Term::Atom(atom)
    }
}

impl From<Pid> for Term {
    fn from(pid: Pid) -> Self {
        Term::Pid(pid)
    }
}

impl From<Reference> for Term {
    fn from(reference: Reference) -> Self {
        Term::Reference(reference)
    }
}

#[cfg(test)]
mod tests;
