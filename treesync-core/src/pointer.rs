//! RFC 6901 JSON Pointer helpers over `serde_json::Value`.
//!
//! Only the operations the apply engine needs: parse, lookup, write and
//! remove. Writes create missing intermediate containers so that property
//! patches can land on a freshly synthesized placeholder.

use serde_json::{Map, Value};

use crate::error::PointerError;

/// The JSON Pointer token that addresses "one past the end" of an array.
pub const APPEND_TOKEN: &str = "-";

/// Split a pointer into unescaped reference tokens.
///
/// `""` addresses the whole document and yields no tokens.
pub fn parse(pointer: &str) -> Result<Vec<String>, PointerError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PointerError::MissingLeadingSlash(pointer.to_string()))?;
    rest.split('/').map(unescape).collect()
}

fn unescape(segment: &str) -> Result<String, PointerError> {
    if !segment.contains('~') {
        return Ok(segment.to_string());
    }
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(PointerError::InvalidEscape(segment.to_string())),
        }
    }
    Ok(out)
}

/// Escape a single token for inclusion in a pointer.
pub fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Join tokens back into a pointer string.
pub fn join<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| format!("/{}", escape(t.as_ref())))
        .collect()
}

fn array_index(token: &str, len: usize, allow_end: bool) -> Result<usize, PointerError> {
    if token == APPEND_TOKEN {
        return if allow_end {
            Ok(len)
        } else {
            Err(PointerError::IndexOutOfBounds { index: len, len })
        };
    }
    // RFC 6901: no leading zeros, no signs.
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return Err(PointerError::InvalidIndex(token.to_string()));
    }
    let index: usize = token
        .parse()
        .map_err(|_| PointerError::InvalidIndex(token.to_string()))?;
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if index > limit || (!allow_end && len == 0) {
        return Err(PointerError::IndexOutOfBounds { index, len });
    }
    Ok(index)
}

/// Look up the value addressed by `tokens`.
pub fn get<'a>(value: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(value, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => array_index(token, items.len(), false)
            .ok()
            .and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `new` at `tokens`.
///
/// With `insert = true` (JSON Patch `add`) an array index shifts the tail
/// right; otherwise it overwrites in place. Missing intermediate members
/// are created as objects, or as arrays when the next token is `-`.
pub fn set(
    value: &mut Value,
    tokens: &[String],
    new: Value,
    insert: bool,
) -> Result<(), PointerError> {
    let Some((last, parents)) = tokens.split_last() else {
        *value = new;
        return Ok(());
    };

    let mut current = value;
    for (i, token) in parents.iter().enumerate() {
        let next_is_append = tokens[i + 1] == APPEND_TOKEN;
        current = descend_or_create(current, token, next_is_append)?;
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), new);
            Ok(())
        }
        Value::Array(items) => {
            if last == APPEND_TOKEN {
                items.push(new);
                return Ok(());
            }
            if insert {
                let index = array_index(last, items.len(), true)?;
                items.insert(index, new);
            } else {
                let index = array_index(last, items.len(), false)?;
                items[index] = new;
            }
            Ok(())
        }
        Value::Null => {
            // A null leaf is promoted to whatever container the write needs.
            if last == APPEND_TOKEN {
                *current = Value::Array(vec![new]);
            } else {
                let mut map = Map::new();
                map.insert(last.clone(), new);
                *current = Value::Object(map);
            }
            Ok(())
        }
        _ => Err(PointerError::NotAContainer(last.clone())),
    }
}

fn descend_or_create<'a>(
    current: &'a mut Value,
    token: &str,
    next_is_append: bool,
) -> Result<&'a mut Value, PointerError> {
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => Ok(map.entry(token.to_string()).or_insert_with(|| {
            if next_is_append {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        })),
        Value::Array(items) => {
            let index = array_index(token, items.len(), false)?;
            Ok(&mut items[index])
        }
        _ => Err(PointerError::NotAContainer(token.to_string())),
    }
}

/// Remove and return the value addressed by `tokens`.
///
/// Array members are spliced out; object members are deleted.
pub fn remove(value: &mut Value, tokens: &[String]) -> Result<Value, PointerError> {
    let Some((last, parents)) = tokens.split_last() else {
        return Err(PointerError::RemoveWholeDocument);
    };

    let mut current = value;
    for token in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| PointerError::NotFound(token.clone()))?,
            Value::Array(items) => {
                let index = array_index(token, items.len(), false)?;
                &mut items[index]
            }
            _ => return Err(PointerError::NotAContainer(token.clone())),
        };
    }

    match current {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PointerError::NotFound(last.clone())),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(PointerError::NotAContainer(last.clone())),
    }
}
