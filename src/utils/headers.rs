//! Header-action application onto the proxy's header objects.
//!
//! Queued header actions are applied at the moment a direction's
//! headers are serialized: request actions onto the upstream request,
//! response actions onto the client response. Failures from the header
//! primitives are logged and the transaction continues without the
//! affected action.

use pingora_http::{RequestHeader, ResponseHeader};

use crate::engine::server::{HeaderAction, HeaderOp};

/// The minimal marshal surface both header objects expose.
pub trait HeaderMarshal {
    fn values(&self, name: &str) -> Vec<String>;
    fn set(&mut self, name: &str, value: &str) -> Result<(), String>;
    fn append(&mut self, name: &str, value: &str) -> Result<(), String>;
    fn remove(&mut self, name: &str);
}

macro_rules! impl_header_marshal {
    ($ty:ty) => {
        impl HeaderMarshal for $ty {
            fn values(&self, name: &str) -> Vec<String> {
                self.headers
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect()
            }

            fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
                self.insert_header(name.to_string(), value)
                    .map_err(|e| e.to_string())
            }

            fn append(&mut self, name: &str, value: &str) -> Result<(), String> {
                self.append_header(name.to_string(), value)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }

            fn remove(&mut self, name: &str) {
                while self.remove_header(name).is_some() {}
            }
        }
    };
}

impl_header_marshal!(RequestHeader);
impl_header_marshal!(ResponseHeader);

/// Applies one direction's queued actions in order.
pub fn apply_header_actions(target: &mut dyn HeaderMarshal, actions: &[HeaderAction]) {
    for action in actions {
        if let Err(e) = apply_one(target, action) {
            log::error!(
                "Header action {:?} on {:?} failed: {e}",
                action.op,
                action.name
            );
        }
    }
}

fn apply_one(target: &mut dyn HeaderMarshal, action: &HeaderAction) -> Result<(), String> {
    match action.op {
        HeaderOp::Set => target.set(&action.name, &action.value),
        HeaderOp::Unset => {
            target.remove(&action.name);
            Ok(())
        }
        HeaderOp::Add => target.append(&action.name, &action.value),
        HeaderOp::Append => {
            let existing = target.values(&action.name);
            if existing.is_empty() {
                target.set(&action.name, &action.value)
            } else {
                let mut joined = existing.join(", ");
                joined.push_str(", ");
                joined.push_str(&action.value);
                target.set(&action.name, &joined)
            }
        }
        HeaderOp::Merge => {
            if target.values(&action.name).iter().any(|v| v == &action.value) {
                Ok(())
            } else {
                target.append(&action.name, &action.value)
            }
        }
        HeaderOp::Edit => {
            let Some(ref pattern) = action.pattern else {
                return Err("edit action without a compiled pattern".to_string());
            };
            let edited: Vec<String> = target
                .values(&action.name)
                .iter()
                .map(|v| pattern.replace_all(v, action.value.as_str()).into_owned())
                .collect();
            if edited.is_empty() {
                return Ok(());
            }
            target.remove(&action.name);
            for value in edited {
                target.append(&action.name, &value)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Direction;
    use regex::Regex;

    fn action(op: HeaderOp, name: &str, value: &str, pattern: Option<&str>) -> HeaderAction {
        HeaderAction {
            dir: Direction::Request,
            op,
            name: name.to_string(),
            value: value.to_string(),
            pattern: pattern.map(|p| Regex::new(p).unwrap()),
        }
    }

    fn request() -> RequestHeader {
        let mut req = RequestHeader::build("GET", b"/a", None).unwrap();
        req.insert_header("User-Agent".to_string(), "oldUA").unwrap();
        req.insert_header("Accept".to_string(), "*/*").unwrap();
        req
    }

    #[test]
    fn edit_substitutes_within_the_value() {
        let mut req = request();
        apply_header_actions(
            &mut req,
            &[action(HeaderOp::Edit, "User-Agent", "new", Some("^old"))],
        );
        assert_eq!(req.values("User-Agent"), vec!["newUA"]);
    }

    #[test]
    fn set_replaces_and_unset_removes() {
        let mut req = request();
        apply_header_actions(
            &mut req,
            &[
                action(HeaderOp::Set, "Accept", "text/html", None),
                action(HeaderOp::Unset, "User-Agent", "", None),
            ],
        );
        assert_eq!(req.values("Accept"), vec!["text/html"]);
        assert!(req.values("User-Agent").is_empty());
    }

    #[test]
    fn add_appends_a_second_field() {
        let mut req = request();
        apply_header_actions(
            &mut req,
            &[
                action(HeaderOp::Add, "X-Tag", "a", None),
                action(HeaderOp::Add, "X-Tag", "b", None),
            ],
        );
        assert_eq!(req.values("X-Tag"), vec!["a", "b"]);
    }

    #[test]
    fn append_joins_with_a_comma() {
        let mut req = request();
        apply_header_actions(
            &mut req,
            &[action(HeaderOp::Append, "Accept", "text/html", None)],
        );
        assert_eq!(req.values("Accept"), vec!["*/*, text/html"]);
    }

    #[test]
    fn merge_skips_identical_values() {
        let mut req = request();
        apply_header_actions(
            &mut req,
            &[
                action(HeaderOp::Merge, "Accept", "*/*", None),
                action(HeaderOp::Merge, "Accept", "text/html", None),
            ],
        );
        assert_eq!(req.values("Accept"), vec!["*/*", "text/html"]);
    }
}
