//! Item payloads.
//!
//! [`ItemContent`] is a closed set of content kinds. Every kind knows its
//! length, whether it counts towards sequence indices, how to split at an
//! offset and whether it can absorb a right neighbour of the same kind.
//!
//! | Ref | Kind    | Length            | Countable |
//! |-----|---------|-------------------|-----------|
//! | 1   | Deleted | stored            | no        |
//! | 2   | Json    | values            | yes       |
//! | 3   | Binary  | 1                 | yes       |
//! | 4   | String  | UTF-16 code units | yes       |
//! | 5   | Embed   | 1                 | yes       |
//! | 6   | Format  | 1                 | no        |
//! | 7   | Type    | 1                 | yes       |
//! | 8   | Any     | values            | yes       |
//! | 9   | Doc     | 1                 | yes       |

use crate::branch::{Branch, TypeKind};
use crate::error::{Error, Result};
use crate::update::{UpdateDecoderV2, UpdateEncoderV2};
use std::sync::Arc;
use weft_codec::Any;

pub const CONTENT_DELETED: u8 = 1;
pub const CONTENT_JSON: u8 = 2;
pub const CONTENT_BINARY: u8 = 3;
pub const CONTENT_STRING: u8 = 4;
pub const CONTENT_EMBED: u8 = 5;
pub const CONTENT_FORMAT: u8 = 6;
pub const CONTENT_TYPE: u8 = 7;
pub const CONTENT_ANY: u8 = 8;
pub const CONTENT_DOC: u8 = 9;

#[derive(Debug)]
pub enum ItemContent {
    Any(Vec<Any>),
    Binary(Vec<u8>),
    /// Placeholder left behind by garbage collection.
    Deleted(u64),
    /// Reference to an embedded sub-document.
    Doc { guid: Arc<str>, opts: Any },
    Embed(Any),
    Format { key: Arc<str>, value: Any },
    /// Values carried as JSON strings on the wire.
    Json(Vec<Any>),
    String(String),
    Type(Box<Branch>),
}

impl ItemContent {
    pub fn len(&self) -> u64 {
        match self {
            ItemContent::Any(values) | ItemContent::Json(values) => values.len() as u64,
            ItemContent::Deleted(len) => *len,
            ItemContent::String(s) => utf16_len(s),
            ItemContent::Binary(_)
            | ItemContent::Doc { .. }
            | ItemContent::Embed(_)
            | ItemContent::Format { .. }
            | ItemContent::Type(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_countable(&self) -> bool {
        !matches!(self, ItemContent::Deleted(_) | ItemContent::Format { .. })
    }

    pub fn content_ref(&self) -> u8 {
        match self {
            ItemContent::Deleted(_) => CONTENT_DELETED,
            ItemContent::Json(_) => CONTENT_JSON,
            ItemContent::Binary(_) => CONTENT_BINARY,
            ItemContent::String(_) => CONTENT_STRING,
            ItemContent::Embed(_) => CONTENT_EMBED,
            ItemContent::Format { .. } => CONTENT_FORMAT,
            ItemContent::Type(_) => CONTENT_TYPE,
            ItemContent::Any(_) => CONTENT_ANY,
            ItemContent::Doc { .. } => CONTENT_DOC,
        }
    }

    /// Split at `offset`: `self` keeps `[0, offset)` and the tail is returned.
    ///
    /// Only multi-element kinds can be split; callers never split inside a
    /// length-one item.
    pub fn splice(&mut self, offset: u64) -> ItemContent {
        let at = offset as usize;
        match self {
            ItemContent::Any(values) => ItemContent::Any(values.split_off(at)),
            ItemContent::Json(values) => ItemContent::Json(values.split_off(at)),
            ItemContent::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                ItemContent::Deleted(right)
            }
            ItemContent::String(s) => ItemContent::String(split_utf16(s, offset)),
            other => panic!(
                "content with ref {} has length 1 and cannot be split",
                other.content_ref()
            ),
        }
    }

    /// Whether `other` can be appended to this content.
    pub fn can_merge(&self, other: &ItemContent) -> bool {
        matches!(
            (self, other),
            (ItemContent::Any(_), ItemContent::Any(_))
                | (ItemContent::Json(_), ItemContent::Json(_))
                | (ItemContent::Deleted(_), ItemContent::Deleted(_))
                | (ItemContent::String(_), ItemContent::String(_))
        )
    }

    /// Append `other`. Must only be called after [`can_merge`](Self::can_merge).
    pub fn merge(&mut self, other: ItemContent) {
        match (self, other) {
            (ItemContent::Any(a), ItemContent::Any(b)) => a.extend(b),
            (ItemContent::Json(a), ItemContent::Json(b)) => a.extend(b),
            (ItemContent::Deleted(a), ItemContent::Deleted(b)) => *a += b,
            (ItemContent::String(a), ItemContent::String(b)) => a.push_str(&b),
            (left, right) => panic!(
                "cannot merge content ref {} with {}",
                left.content_ref(),
                right.content_ref()
            ),
        }
    }

    /// Fresh copy used when an item is redone. Nested types are copied as
    /// empty types of the same kind; their children are restored separately.
    pub fn copy(&self) -> ItemContent {
        match self {
            ItemContent::Any(v) => ItemContent::Any(v.clone()),
            ItemContent::Binary(b) => ItemContent::Binary(b.clone()),
            ItemContent::Deleted(len) => ItemContent::Deleted(*len),
            ItemContent::Doc { guid, opts } => ItemContent::Doc {
                guid: guid.clone(),
                opts: opts.clone(),
            },
            ItemContent::Embed(v) => ItemContent::Embed(v.clone()),
            ItemContent::Format { key, value } => ItemContent::Format {
                key: key.clone(),
                value: value.clone(),
            },
            ItemContent::Json(v) => ItemContent::Json(v.clone()),
            ItemContent::String(s) => ItemContent::String(s.clone()),
            ItemContent::Type(branch) => ItemContent::Type(Box::new(Branch::new(branch.kind))),
        }
    }

    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            ItemContent::Type(branch) => Some(branch),
            _ => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            ItemContent::Type(branch) => Some(branch),
            _ => None,
        }
    }

    /// Write the content starting at element `offset`.
    pub(crate) fn encode(&self, enc: &mut UpdateEncoderV2, offset: u64) {
        let skip = offset as usize;
        match self {
            ItemContent::Deleted(len) => enc.write_len(*len - offset),
            ItemContent::Json(values) => {
                enc.write_len(values.len() as u64 - offset);
                for value in &values[skip..] {
                    enc.write_string(&value.to_json_string());
                }
            }
            ItemContent::Binary(bytes) => enc.write_buf(bytes),
            ItemContent::String(s) => {
                if offset == 0 {
                    enc.write_string(s);
                } else {
                    let mut head = s.clone();
                    let tail = split_utf16(&mut head, offset);
                    enc.write_string(&tail);
                }
            }
            ItemContent::Embed(value) => enc.write_json(value),
            ItemContent::Format { key, value } => {
                enc.write_key(key);
                enc.write_json(value);
            }
            ItemContent::Type(branch) => enc.write_type_ref(branch.kind.type_ref()),
            ItemContent::Any(values) => {
                enc.write_len(values.len() as u64 - offset);
                for value in &values[skip..] {
                    enc.write_any(value);
                }
            }
            ItemContent::Doc { guid, opts } => {
                enc.write_string(guid);
                enc.write_any(opts);
            }
        }
    }

    pub(crate) fn decode(dec: &mut UpdateDecoderV2<'_>, content_ref: u8) -> Result<ItemContent> {
        Ok(match content_ref {
            CONTENT_DELETED => ItemContent::Deleted(dec.read_len()?),
            CONTENT_JSON => {
                let len = dec.read_len()?;
                let mut values = Vec::new();
                for _ in 0..len {
                    values.push(Any::from_json_str(dec.read_string()?)?);
                }
                ItemContent::Json(values)
            }
            CONTENT_BINARY => ItemContent::Binary(dec.read_buf()?.to_vec()),
            CONTENT_STRING => ItemContent::String(dec.read_string()?.to_owned()),
            CONTENT_EMBED => ItemContent::Embed(dec.read_json()?),
            CONTENT_FORMAT => {
                let key = dec.read_key()?;
                ItemContent::Format {
                    key,
                    value: dec.read_json()?,
                }
            }
            CONTENT_TYPE => {
                let type_ref = dec.read_type_ref()?;
                let kind = TypeKind::from_type_ref(type_ref).ok_or(Error::UnknownTypeRef(type_ref))?;
                ItemContent::Type(Box::new(Branch::new(kind)))
            }
            CONTENT_ANY => {
                let len = dec.read_len()?;
                let mut values = Vec::new();
                for _ in 0..len {
                    values.push(dec.read_any()?);
                }
                ItemContent::Any(values)
            }
            CONTENT_DOC => {
                let guid: Arc<str> = dec.read_string()?.into();
                ItemContent::Doc {
                    guid,
                    opts: dec.read_any()?,
                }
            }
            other => return Err(Error::UnknownContentRef(other)),
        })
    }
}

pub(crate) fn utf16_len(s: &str) -> u64 {
    s.encode_utf16().count() as u64
}

/// Split `s` at a UTF-16 offset, returning the tail. A split inside a
/// surrogate pair replaces both halves with U+FFFD so that each side stays
/// valid and keeps its UTF-16 length.
pub(crate) fn split_utf16(s: &mut String, offset: u64) -> String {
    let mut units = 0u64;
    let mut cut = None;
    for (idx, ch) in s.char_indices() {
        if units == offset {
            cut = Some((idx, false, ch.len_utf8()));
            break;
        }
        let width = ch.len_utf16() as u64;
        if units + width > offset {
            cut = Some((idx, true, ch.len_utf8()));
            break;
        }
        units += width;
    }
    match cut {
        Some((idx, false, _)) => s.split_off(idx),
        Some((idx, true, width)) => {
            let rest = s[idx + width..].to_string();
            s.truncate(idx);
            s.push('\u{FFFD}');
            format!("\u{FFFD}{rest}")
        }
        None => String::new(),
    }
}
