//! Persona records
//!
//! Persona payload frames begin with the `KITE PERSONAS` magic followed by
//! concatenated vCards. `X-KITEID` carries the persona id, `FN` the display
//! name, `PHOTO` an optional avatar (base64 when the `ENCODING=b` parameter
//! is present).

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::wire::WireError;
use crate::PERSONAS_MAGIC;

/// A user identity scoped to one appliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo: Option<Vec<u8>>,
}

/// Parse a persona payload frame into its records.
///
/// vCards missing an `X-KITEID` are skipped with a diagnostic; a payload
/// without the magic prefix is a protocol violation.
pub fn parse_personas(payload: &[u8]) -> Result<Vec<Persona>, WireError> {
    let text = std::str::from_utf8(payload)?;
    let body = text.strip_prefix(PERSONAS_MAGIC).ok_or(WireError::BadMagic)?;

    let mut personas = Vec::new();
    let mut current: Option<PartialPersona> = None;

    for line in unfold_lines(body) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let (prop, params) = match name.split_once(';') {
            Some((p, rest)) => (p, Some(rest)),
            None => (name, None),
        };

        match prop.to_ascii_uppercase().as_str() {
            "BEGIN" if value.eq_ignore_ascii_case("VCARD") => {
                current = Some(PartialPersona::default());
            }
            "END" if value.eq_ignore_ascii_case("VCARD") => {
                if let Some(partial) = current.take() {
                    match partial.finish() {
                        Some(persona) => personas.push(persona),
                        None => warn!("skipping persona vCard without X-KITEID"),
                    }
                }
            }
            "X-KITEID" => {
                if let Some(p) = current.as_mut() {
                    p.id = Some(value.to_owned());
                }
            }
            "FN" => {
                if let Some(p) = current.as_mut() {
                    p.display_name = Some(value.to_owned());
                }
            }
            "PHOTO" => {
                if let Some(p) = current.as_mut() {
                    p.photo = Some(decode_photo(params, value));
                }
            }
            _ => {}
        }
    }

    Ok(personas)
}

#[derive(Default)]
struct PartialPersona {
    id: Option<String>,
    display_name: Option<String>,
    photo: Option<Vec<u8>>,
}

impl PartialPersona {
    fn finish(self) -> Option<Persona> {
        Some(Persona {
            id: self.id?,
            display_name: self.display_name.unwrap_or_default(),
            photo: self.photo,
        })
    }
}

/// Unfold vCard continuation lines (leading space or tab continues the
/// previous line).
fn unfold_lines(body: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in body.lines() {
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
                continue;
            }
        }
        lines.push(raw.to_owned());
    }
    lines
}

fn decode_photo(params: Option<&str>, value: &str) -> Vec<u8> {
    use base64::Engine as _;

    let base64_encoded = params
        .map(|p| {
            p.split(';').any(|param| {
                param.eq_ignore_ascii_case("encoding=b") || param.eq_ignore_ascii_case("base64")
            })
        })
        .unwrap_or(false);

    if base64_encoded {
        match base64::engine::general_purpose::STANDARD.decode(value.trim()) {
            Ok(bytes) => return bytes,
            Err(err) => warn!("undecodable persona PHOTO, keeping raw bytes: {err}"),
        }
    }
    value.as_bytes().to_vec()
}
