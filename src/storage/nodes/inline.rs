#![forbid(unsafe_code)]
//! Terms whose value fits in the id itself.
//!
//! Only canonical lexical forms are inlined so that decoding an id gives
//! back exactly the term that produced it.

use time::{Date, Month};

use super::term::{Term, XSD_BOOLEAN, XSD_DATE, XSD_INTEGER};
use crate::types::NodeId;

const INT_MIN: i64 = -(1 << 55);
const INT_MAX: i64 = (1 << 55) - 1;

/// Packs `term` into an inline id when it has an inline shape.
pub fn encode(term: &Term) -> Option<NodeId> {
    let Term::Literal {
        lexical,
        datatype: Some(datatype),
        lang: None,
    } = term
    else {
        return None;
    };
    match datatype.as_str() {
        XSD_INTEGER => {
            let value: i64 = lexical.parse().ok()?;
            if !(INT_MIN..=INT_MAX).contains(&value) || value.to_string() != *lexical {
                return None;
            }
            Some(NodeId::from_parts(NodeId::TAG_INTEGER, value as u64))
        }
        XSD_BOOLEAN => match lexical.as_str() {
            "false" => Some(NodeId::from_parts(NodeId::TAG_BOOLEAN, 0)),
            "true" => Some(NodeId::from_parts(NodeId::TAG_BOOLEAN, 1)),
            _ => None,
        },
        XSD_DATE => {
            let date = parse_date(lexical)?;
            let payload =
                ((date.year() as u64) << 9) | ((date.month() as u64) << 5) | date.day() as u64;
            Some(NodeId::from_parts(NodeId::TAG_DATE, payload))
        }
        _ => None,
    }
}

/// Unpacks an inline id; `None` for ids that are not inline or hold an
/// impossible payload.
pub fn decode(id: NodeId) -> Option<Term> {
    let payload = id.payload();
    match id.tag() {
        NodeId::TAG_INTEGER => {
            let value = ((payload << 8) as i64) >> 8;
            Some(Term::integer(value))
        }
        NodeId::TAG_BOOLEAN => match payload {
            0 => Some(Term::boolean(false)),
            1 => Some(Term::boolean(true)),
            _ => None,
        },
        NodeId::TAG_DATE => {
            let year = i32::try_from(payload >> 9).ok()?;
            let month = Month::try_from(((payload >> 5) & 0x0F) as u8).ok()?;
            let day = (payload & 0x1F) as u8;
            let date = Date::from_calendar_date(year, month, day).ok()?;
            Some(Term::typed(format_date(date), XSD_DATE))
        }
        _ => None,
    }
}

fn parse_date(lexical: &str) -> Option<Date> {
    let bytes = lexical.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &lexical[range];
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let year = digits(0..4)?;
    let month = Month::try_from(digits(5..7)? as u8).ok()?;
    let day = digits(8..10)? as u8;
    Date::from_calendar_date(year as i32, month, day).ok()
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}
