//! Moves a CA bundle through environment variables.
//!
//! A bundle can be larger than a single environment variable should carry, so
//! it is split into one canonically encoded PEM block per variable
//! (`<PREFIX>_0`, `<PREFIX>_1`, ...) and reassembled by the init container.
//! Splitting is permissive and drops anything that is not a PEM block, while
//! reassembly is strict and rejects the whole bundle on a single bad fragment.

use std::{collections::HashMap, ops::Range};

use log::debug;
use pem::{EncodeConfig, LineEnding, Pem};

use crate::Error;

/// Name prefix of the indexed variables handed to the init container.
pub const CA_CERTS_ENV_PREFIX: &str = "CA_CERTS_DATA";

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const DASHES: &str = "-----";

/// Locates the next BEGIN/END delimited span at or after `from`.
///
/// A BEGIN marker is accepted anywhere, including mid-line or after
/// indentation, so blocks pasted behind `subject=` style headers are kept.
/// Only the label must stay on one line.
///
/// Returns the span and the offset just past the BEGIN marker, where scanning
/// resumes if the span does not decode.
fn find_block(input: &str, from: usize) -> Option<(Range<usize>, usize)> {
    let mut search = from;
    loop {
        let start = search + input[search..].find(BEGIN)?;
        let label_start = start + BEGIN.len();
        let label_len = input[label_start..].find(DASHES)?;
        let label = &input[label_start..label_start + label_len];
        if label.contains('\n') {
            search = label_start;
            continue;
        }
        let end_marker = format!("{END}{label}{DASHES}");
        let body_start = label_start + label_len + DASHES.len();
        match input[body_start..].find(&end_marker) {
            Some(offset) => {
                return Some((
                    start..body_start + offset + end_marker.len(),
                    label_start,
                ))
            }
            None => search = label_start,
        }
    }
}

fn encode(block: &Pem) -> String {
    pem::encode_config(block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Splits a bundle into canonically re-encoded PEM blocks, in order.
///
/// Text around or between blocks, and blocks that fail to decode, are skipped.
pub fn split(bundle: &str) -> Vec<String> {
    let mut out = vec![];
    let mut pos = 0;
    while let Some((span, resume)) = find_block(bundle, pos) {
        match pem::parse(&bundle[span.clone()]) {
            Ok(block) => {
                out.push(encode(&block));
                pos = span.end;
            }
            Err(e) => {
                debug!("skipping malformed PEM block at offset {}: {e}", span.start);
                pos = resume;
            }
        }
    }
    out
}

/// Builds the `<PREFIX>_<i>` variable name for fragment `index`.
pub fn fragment_name(prefix: &str, index: usize) -> String {
    format!("{prefix}_{index}")
}

fn is_single_block(fragment: &str) -> bool {
    let trimmed = fragment.trim();
    match find_block(trimmed, 0) {
        Some((span, _)) if span.start == 0 && span.end == trimmed.len() => {
            pem::parse(trimmed).is_ok()
        }
        _ => false,
    }
}

/// Reassembles a bundle from `<prefix>_0`, `<prefix>_1`, ... in `environ`.
///
/// Reading stops at the first missing index. Every fragment found must be
/// exactly one PEM block, otherwise the whole parse fails. Returns the
/// concatenated fragments and how many were consumed.
pub fn parse<I, K, V>(prefix: &str, environ: I) -> Result<(String, usize), Error>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let vars: HashMap<String, String> = environ
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    let mut bundle = String::new();
    let mut count = 0;
    loop {
        let name = fragment_name(prefix, count);
        let Some(fragment) = vars.get(&name) else {
            return Ok((bundle, count));
        };
        if !is_single_block(fragment) {
            return Err(Error::CertError(format!("{name} is not a single PEM block")));
        }
        bundle.push_str(fragment);
        count += 1;
    }
}
