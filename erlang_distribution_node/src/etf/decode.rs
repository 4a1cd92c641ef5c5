use nom::{
    bytes::complete::take,
    error::{ErrorKind, ParseError},
    number::complete::{be_f64, be_i32, be_u16, be_u32, be_u64, be_u8},
    IResult,
};

use super::{
    consts::{tag, VERSION_TAG},
    Atom, AtomTooLong, BigInt, Export, Fun, Pid, Port, Reference, Term,
};

/// Nesting bound applied to terms arriving from the network.
pub const DEFAULT_MAX_DEPTH: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("input ended before the term was complete")]
    Truncated,
    #[error("expected version tag 131, found {0}")]
    BadVersion(u8),
    #[error("unknown term tag {0}")]
    UnknownTag(u8),
    #[error("expected {expected} as {context}")]
    UnexpectedTerm {
        expected: &'static str,
        context: &'static str,
    },
    #[error("atom text is not valid utf-8")]
    InvalidAtom,
    #[error("atom of {0} characters exceeds the limit of 255")]
    AtomTooLong(usize),
    #[error("legacy float text could not be parsed")]
    InvalidFloat,
    #[error("term nesting exceeds {0} levels")]
    TooDeep(usize),
    #[error("{0} bytes left over after the term")]
    TrailingBytes(usize),
    #[error("malformed term ({0:?})")]
    Malformed(ErrorKind),
}

impl<'a> ParseError<&'a [u8]> for DecodeError {
    fn from_error_kind(_input: &'a [u8], kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Eof => DecodeError::Truncated,
            other => DecodeError::Malformed(other),
        }
    }

    fn append(_input: &'a [u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type PResult<'a, T> = IResult<&'a [u8], T, DecodeError>;

fn fail<'a, T>(error: DecodeError) -> PResult<'a, T> {
    Err(nom::Err::Failure(error))
}

fn p_u8(i: &[u8]) -> PResult<'_, u8> {
    be_u8(i)
}
fn p_u16(i: &[u8]) -> PResult<'_, u16> {
    be_u16(i)
}
fn p_u32(i: &[u8]) -> PResult<'_, u32> {
    be_u32(i)
}
fn p_u64(i: &[u8]) -> PResult<'_, u64> {
    be_u64(i)
}
fn p_i32(i: &[u8]) -> PResult<'_, i32> {
    be_i32(i)
}
fn p_f64(i: &[u8]) -> PResult<'_, f64> {
    be_f64(i)
}
fn p_take(i: &[u8], len: usize) -> PResult<'_, &[u8]> {
    take(len)(i)
}

fn finish<T>(result: Result<T, nom::Err<DecodeError>>) -> Result<T, DecodeError> {
    result.map_err(|err| match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => DecodeError::Truncated,
    })
}

/// Decodes one complete term, starting at the version tag. No nesting bound
/// is applied; use [`decode_with_depth`] for untrusted input.
pub fn decode(bytes: &[u8]) -> Result<Term, DecodeError> {
    decode_with_depth(bytes, usize::MAX)
}

pub fn decode_with_depth(bytes: &[u8], max_depth: usize) -> Result<Term, DecodeError> {
    let (term, rest) = decode_prefix(bytes, max_depth)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(term)
}

/// Decodes a versioned term from the front of `bytes`, returning what follows it.
pub fn decode_prefix(bytes: &[u8], max_depth: usize) -> Result<(Term, &[u8]), DecodeError> {
    let (version, rest) = bytes.split_first().ok_or(DecodeError::Truncated)?;
    if *version != VERSION_TAG {
        return Err(DecodeError::BadVersion(*version));
    }
    let parser = TermParser { max_depth };
    let (rest, term) = finish(parser.term(rest, 0))?;
    Ok((term, rest))
}

struct TermParser {
    max_depth: usize,
}

impl TermParser {
    fn term<'a>(&self, input: &'a [u8], depth: usize) -> PResult<'a, Term> {
        if depth > self.max_depth {
            return fail(DecodeError::TooDeep(self.max_depth));
        }

        let (input, tag) = p_u8(input)?;
        match tag {
            tag::NIL_EXT => Ok((input, Term::Nil)),

            // Numbers
            tag::SMALL_INTEGER_EXT => {
                let (i, v) = p_u8(input)?;
                Ok((i, Term::Integer(v.into())))
            }
            tag::INTEGER_EXT => {
                let (i, v) = p_i32(input)?;
                Ok((i, Term::Integer(v)))
            }
            tag::NEW_FLOAT_EXT => {
                let (i, v) = p_f64(input)?;
                Ok((i, Term::Float(v)))
            }
            tag::FLOAT_EXT => {
                let (i, text) = p_take(input, 31)?;
                let text = std::str::from_utf8(text)
                    .ok()
                    .map(|t| t.trim_end_matches('\0').trim())
                    .and_then(|t| t.parse::<f64>().ok());
                match text {
                    Some(v) => Ok((i, Term::Float(v))),
                    None => fail(DecodeError::InvalidFloat),
                }
            }
            tag::SMALL_BIG_EXT => {
                let (i, n) = p_u8(input)?;
                self.big(i, n.into())
            }
            tag::LARGE_BIG_EXT => {
                let (i, n) = p_u32(input)?;
                self.big(i, n as usize)
            }

            // Atoms
            tag::ATOM_UTF8_EXT | tag::SMALL_ATOM_UTF8_EXT | tag::ATOM_EXT | tag::SMALL_ATOM_EXT => {
                let (i, atom) = atom_body(tag, input)?;
                Ok((i, Term::Atom(atom)))
            }

            // Binaries
            tag::BINARY_EXT => {
                let (i, len) = p_u32(input)?;
                let (i, data) = p_take(i, len as usize)?;
                Ok((i, Term::Binary(data.to_vec())))
            }
            tag::BIT_BINARY_EXT => {
                let (i, len) = p_u32(input)?;
                let (i, bits) = p_u8(i)?;
                let (i, data) = p_take(i, len as usize)?;
                Ok((
                    i,
                    Term::BitString {
                        data: data.to_vec(),
                        bits,
                    },
                ))
            }

            // Identities
            tag::PID_EXT | tag::NEW_PID_EXT => {
                let (i, node) = node_atom(input, "pid node")?;
                let (i, id) = p_u32(i)?;
                let (i, serial) = p_u32(i)?;
                let (i, creation) = creation(i, tag == tag::NEW_PID_EXT)?;
                Ok((
                    i,
                    Term::Pid(Pid {
                        node,
                        id,
                        serial,
                        creation,
                    }),
                ))
            }
            tag::PORT_EXT | tag::NEW_PORT_EXT | tag::V4_PORT_EXT => {
                let (i, node) = node_atom(input, "port node")?;
                let (i, id) = if tag == tag::V4_PORT_EXT {
                    p_u64(i)?
                } else {
                    let (i, id) = p_u32(i)?;
                    (i, id.into())
                };
                let (i, creation) = creation(i, tag != tag::PORT_EXT)?;
                Ok((i, Term::Port(Port { node, id, creation })))
            }
            tag::REFERENCE_EXT => {
                let (i, node) = node_atom(input, "reference node")?;
                let (i, id) = p_u32(i)?;
                let (i, creation) = creation(i, false)?;
                Ok((
                    i,
                    Term::Reference(Reference {
                        node,
                        creation,
                        ids: vec![id],
                    }),
                ))
            }
            tag::NEW_REFERENCE_EXT | tag::NEWER_REFERENCE_EXT => {
                let (i, len) = p_u16(input)?;
                let (i, node) = node_atom(i, "reference node")?;
                let (mut i, creation) = creation(i, tag == tag::NEWER_REFERENCE_EXT)?;
                let mut ids = Vec::with_capacity(len.into());
                for _ in 0..len {
                    let (rest, id) = p_u32(i)?;
                    ids.push(id);
                    i = rest;
                }
                Ok((i, Term::Reference(Reference { node, creation, ids })))
            }

            // Functions
            tag::NEW_FUN_EXT => {
                let (i, _size) = p_u32(input)?;
                let (i, arity) = p_u8(i)?;
                let (i, uniq) = p_take(i, 16)?;
                let (i, index) = p_u32(i)?;
                let (i, num_free) = p_u32(i)?;
                let (i, module) = node_atom(i, "fun module")?;
                let (i, old_index) = self.term(i, depth + 1)?;
                let (i, old_uniq) = self.term(i, depth + 1)?;
                let (i, pid) = match self.term(i, depth + 1)? {
                    (i, Term::Pid(pid)) => (i, pid),
                    _ => {
                        return fail(DecodeError::UnexpectedTerm {
                            expected: "pid",
                            context: "fun creator",
                        })
                    }
                };
                let (i, free_vars) = self.many(i, num_free as usize, depth)?;
                let mut uniq_bytes = [0u8; 16];
                uniq_bytes.copy_from_slice(uniq);
                Ok((
                    i,
                    Term::Fun(Box::new(Fun {
                        arity,
                        uniq: uniq_bytes,
                        index,
                        module,
                        old_index,
                        old_uniq,
                        pid,
                        free_vars,
                    })),
                ))
            }
            tag::EXPORT_EXT => {
                let (i, module) = node_atom(input, "export module")?;
                let (i, function) = node_atom(i, "export function")?;
                let (i, arity) = match self.term(i, depth + 1)? {
                    (i, Term::Integer(arity)) if (0..=255).contains(&arity) => (i, arity as u8),
                    _ => {
                        return fail(DecodeError::UnexpectedTerm {
                            expected: "small integer",
                            context: "export arity",
                        })
                    }
                };
                Ok((
                    i,
                    Term::Export(Box::new(Export {
                        module,
                        function,
                        arity,
                    })),
                ))
            }

            // Compounds
            tag::SMALL_TUPLE_EXT => {
                let (i, arity) = p_u8(input)?;
                let (i, elements) = self.many(i, arity.into(), depth)?;
                Ok((i, Term::Tuple(elements)))
            }
            tag::LARGE_TUPLE_EXT => {
                let (i, arity) = p_u32(input)?;
                let (i, elements) = self.many(i, arity as usize, depth)?;
                Ok((i, Term::Tuple(elements)))
            }
            tag::MAP_EXT => {
                let (mut i, arity) = p_u32(input)?;
                let mut pairs = Vec::with_capacity((arity as usize).min(i.len() / 2));
                for _ in 0..arity {
                    let (rest, key) = self.term(i, depth + 1)?;
                    let (rest, value) = self.term(rest, depth + 1)?;
                    pairs.push((key, value));
                    i = rest;
                }
                Ok((i, Term::map(pairs)))
            }
            tag::STRING_EXT => {
                let (i, len) = p_u16(input)?;
                let (i, data) = p_take(i, len.into())?;
                Ok((i, Term::String(data.to_vec())))
            }
            tag::LIST_EXT => {
                let (i, len) = p_u32(input)?;
                let (i, elements) = self.many(i, len as usize, depth)?;
                let (i, tail) = self.term(i, depth + 1)?;
                Ok((i, Term::List(elements, Box::new(tail))))
            }

            unknown => fail(DecodeError::UnknownTag(unknown)),
        }
    }

    fn many<'a>(&self, mut input: &'a [u8], count: usize, depth: usize) -> PResult<'a, Vec<Term>> {
        // Every element takes at least one byte, which bounds the allocation.
        let mut elements = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            let (rest, element) = self.term(input, depth + 1)?;
            elements.push(element);
            input = rest;
        }
        Ok((input, elements))
    }

    fn big<'a>(&self, input: &'a [u8], len: usize) -> PResult<'a, Term> {
        let (i, sign) = p_u8(input)?;
        let (i, digits) = p_take(i, len)?;
        Ok((
            i,
            Term::BigInt(BigInt {
                negative: sign != 0,
                digits: digits.to_vec(),
            }),
        ))
    }
}

fn creation(input: &[u8], wide: bool) -> PResult<'_, u32> {
    if wide {
        p_u32(input)
    } else {
        let (i, creation) = p_u8(input)?;
        Ok((i, creation.into()))
    }
}

fn atom_body(tag: u8, input: &[u8]) -> PResult<'_, Atom> {
    let (i, len) = match tag {
        tag::SMALL_ATOM_UTF8_EXT | tag::SMALL_ATOM_EXT => {
            let (i, len) = p_u8(input)?;
            (i, usize::from(len))
        }
        _ => {
            let (i, len) = p_u16(input)?;
            (i, usize::from(len))
        }
    };
    let (i, text) = p_take(i, len)?;
    let name = match tag {
        tag::ATOM_UTF8_EXT | tag::SMALL_ATOM_UTF8_EXT => match std::str::from_utf8(text) {
            Ok(name) => name.to_owned(),
            Err(_) => return fail(DecodeError::InvalidAtom),
        },
        // Latin-1 maps one byte to one codepoint.
        _ => text.iter().map(|b| char::from(*b)).collect(),
    };
    match Atom::try_new(name) {
        Ok(atom) => Ok((i, atom)),
        Err(AtomTooLong(chars)) => fail(DecodeError::AtomTooLong(chars)),
    }
}

fn node_atom<'a>(input: &'a [u8], context: &'static str) -> PResult<'a, Atom> {
    let (i, tag) = p_u8(input)?;
    match tag {
        tag::ATOM_UTF8_EXT | tag::SMALL_ATOM_UTF8_EXT | tag::ATOM_EXT | tag::SMALL_ATOM_EXT => {
            atom_body(tag, i)
        }
        _ => fail(DecodeError::UnexpectedTerm {
            expected: "atom",
            context,
        }),
    }
}
