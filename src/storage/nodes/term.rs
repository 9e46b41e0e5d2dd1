#![forbid(unsafe_code)]

use std::fmt;

use crate::primitives::bytes::buf::{self, Reader};
use crate::types::{Result, StoreError};

/// `xsd:integer`
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
/// `xsd:boolean`
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
/// `xsd:date`
pub const XSD_DATE: &str = "http://www.w3.org/2001/XMLSchema#date";

const TAG_IRI: u8 = 1;
const TAG_BLANK: u8 = 2;
const TAG_LITERAL: u8 = 3;

const HAS_DATATYPE: u8 = 0b01;
const HAS_LANG: u8 = 0b10;

/// An RDF term as stored in the node table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    /// An IRI, without angle brackets.
    Iri(String),
    /// A blank node label, without the `_:` prefix.
    Blank(String),
    /// A literal with an optional datatype IRI or language tag.
    Literal {
        /// Lexical form.
        lexical: String,
        /// Datatype IRI; `None` for plain and language-tagged literals.
        datatype: Option<String>,
        /// Language tag.
        lang: Option<String>,
    },
}

impl Term {
    /// Builds an IRI term.
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    /// Builds a blank node.
    pub fn blank(label: impl Into<String>) -> Self {
        Term::Blank(label.into())
    }

    /// Builds a plain literal.
    pub fn literal(lexical: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: None,
        }
    }

    /// Builds a typed literal.
    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: Some(datatype.into()),
            lang: None,
        }
    }

    /// Builds a language-tagged literal.
    pub fn lang(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        Term::Literal {
            lexical: lexical.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }

    /// `xsd:integer` literal in canonical form.
    pub fn integer(value: i64) -> Self {
        Term::typed(value.to_string(), XSD_INTEGER)
    }

    /// `xsd:boolean` literal.
    pub fn boolean(value: bool) -> Self {
        Term::typed(if value { "true" } else { "false" }, XSD_BOOLEAN)
    }

    /// Canonical byte form: a tag byte followed by length-prefixed UTF-8.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Term::Iri(iri) => {
                out.push(TAG_IRI);
                buf::put_string(&mut out, iri);
            }
            Term::Blank(label) => {
                out.push(TAG_BLANK);
                buf::put_string(&mut out, label);
            }
            Term::Literal {
                lexical,
                datatype,
                lang,
            } => {
                out.push(TAG_LITERAL);
                let mut flags = 0;
                if datatype.is_some() {
                    flags |= HAS_DATATYPE;
                }
                if lang.is_some() {
                    flags |= HAS_LANG;
                }
                out.push(flags);
                buf::put_string(&mut out, lexical);
                if let Some(datatype) = datatype {
                    buf::put_string(&mut out, datatype);
                }
                if let Some(lang) = lang {
                    buf::put_string(&mut out, lang);
                }
            }
        }
        out
    }

    /// Decodes the canonical byte form.
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(src, "term");
        let term = match reader.u8()? {
            TAG_IRI => Term::Iri(reader.string()?),
            TAG_BLANK => Term::Blank(reader.string()?),
            TAG_LITERAL => {
                let flags = reader.u8()?;
                if flags & !(HAS_DATATYPE | HAS_LANG) != 0 {
                    return Err(StoreError::Corruption("term literal has unknown flags"));
                }
                let lexical = reader.string()?;
                let datatype = if flags & HAS_DATATYPE != 0 {
                    Some(reader.string()?)
                } else {
                    None
                };
                let lang = if flags & HAS_LANG != 0 {
                    Some(reader.string()?)
                } else {
                    None
                };
                Term::Literal {
                    lexical,
                    datatype,
                    lang,
                }
            }
            other => {
                return Err(StoreError::CorruptionOwned(format!(
                    "unknown term tag {other:#04x}"
                )))
            }
        };
        reader.finish()?;
        Ok(term)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Blank(label) => write!(f, "_:{label}"),
            Term::Literal {
                lexical,
                datatype,
                lang,
            } => {
                write!(f, "{lexical:?}")?;
                if let Some(lang) = lang {
                    write!(f, "@{lang}")?;
                }
                if let Some(datatype) = datatype {
                    write!(f, "^^<{datatype}>")?;
                }
                Ok(())
            }
        }
    }
}
