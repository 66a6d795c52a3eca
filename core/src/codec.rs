/*
 * codec.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, a polled asynchronous HTTP client.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Header block and body content encoding/decoding. Stateless: header blocks
//! are CRLF-separated "Key: Value" lines; bodies are built from key/value
//! content items as form-urlencoded or JSON per the declared encoding.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Form component safe set: everything reserved in a query component is
/// encoded, plus space, '%', '+' and '&'/'=' so items cannot run together.
const FORM_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b'=')
    .add(b'?')
    .add(b'[')
    .add(b']');

/// Declared body encoding for the content items of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    /// application/x-www-form-urlencoded
    FormUrlEncoded,
    /// application/json (items become a flat string-valued object)
    Json,
}

impl ContentEncoding {
    /// MIME type synthesized into the outgoing Content-Type header.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentEncoding::FormUrlEncoded => "application/x-www-form-urlencoded",
            ContentEncoding::Json => "application/json",
        }
    }
}

/// Encode an outgoing header block: caller headers in order, then a
/// synthesized Content-Type when `content_type` is set. Keys are assumed
/// unique (enforced at submit).
pub fn encode_header_block(headers: &[(String, String)], content_type: Option<&str>) -> String {
    let mut block = String::new();
    for (key, value) in headers {
        block.push_str(key);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    if let Some(mime) = content_type {
        let caller_set = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
        if !caller_set {
            block.push_str("Content-Type: ");
            block.push_str(mime);
            block.push_str("\r\n");
        }
    }
    block
}

/// Decode a raw header block into ordered key/value pairs. Tolerates bare LF
/// line endings and skips lines without a colon (including the status line a
/// transport may prepend to its raw block).
pub fn decode_header_block(raw: &str) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if let Some(colon) = line.find(':') {
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if !name.is_empty() {
                headers.push((name.to_string(), value.to_string()));
            }
        }
    }
    headers
}

/// Encode content items as application/x-www-form-urlencoded.
pub fn encode_form_items(items: &[(String, String)]) -> Vec<u8> {
    let mut body = String::new();
    for (i, (key, value)) in items.iter().enumerate() {
        if i > 0 {
            body.push('&');
        }
        body.push_str(&utf8_percent_encode(key, FORM_COMPONENT).to_string());
        body.push('=');
        body.push_str(&utf8_percent_encode(value, FORM_COMPONENT).to_string());
    }
    body.into_bytes()
}

/// Encode content items as a flat JSON object with string values.
pub fn encode_json_items(items: &[(String, String)]) -> Vec<u8> {
    let mut map = serde_json::Map::new();
    for (key, value) in items {
        map.insert(key.clone(), serde_json::Value::String(value.clone()));
    }
    serde_json::Value::Object(map).to_string().into_bytes()
}

/// Encode content items per the declared encoding. Empty items produce an
/// empty body regardless of encoding.
pub fn encode_content(encoding: &ContentEncoding, items: &[(String, String)]) -> Vec<u8> {
    if items.is_empty() {
        return Vec::new();
    }
    match encoding {
        ContentEncoding::FormUrlEncoded => encode_form_items(items),
        ContentEncoding::Json => encode_json_items(items),
    }
}
