// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    instancetag::{InstanceTag, INSTANCE_ZERO},
    OTRError, Version,
};

static FRAGMENT_V3_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]*),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});

static FRAGMENT_V2_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR,(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]*),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});

const FRAGMENT_V3_PREFIX: &[u8] = b"?OTR|";
const FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";

const MAX_FRAGMENTS: usize = 65535;

/// `match_fragment` checks whether the content uses one of the two
/// fragment syntaxes.
#[must_use]
pub fn match_fragment(content: &[u8]) -> bool {
    content.starts_with(FRAGMENT_V3_PREFIX) || content.starts_with(FRAGMENT_V2_PREFIX)
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentError {
    /// Not enough fragments have arrived yet to reconstruct the message.
    IncompleteResult,
    /// Fragment with invalid or out-of-order framing; the accumulated run
    /// is discarded.
    InvalidFragment,
    /// The fragment addresses an instance the local client is not
    /// tracking.
    UnknownInstance,
}

#[derive(Debug)]
pub struct Fragment {
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub part: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

pub fn parse(content: &[u8]) -> Result<Fragment, FragmentError> {
    if let Some(captures) = FRAGMENT_V3_PATTERN.captures(content) {
        return Ok(Fragment {
            sender: parse_tag(captures.get(1).unwrap().as_bytes())?,
            receiver: parse_tag(captures.get(2).unwrap().as_bytes())?,
            part: parse_counter(captures.get(3).unwrap().as_bytes())?,
            total: parse_counter(captures.get(4).unwrap().as_bytes())?,
            payload: Vec::from(captures.get(5).unwrap().as_bytes()),
        });
    }
    if let Some(captures) = FRAGMENT_V2_PATTERN.captures(content) {
        return Ok(Fragment {
            sender: INSTANCE_ZERO,
            receiver: INSTANCE_ZERO,
            part: parse_counter(captures.get(1).unwrap().as_bytes())?,
            total: parse_counter(captures.get(2).unwrap().as_bytes())?,
            payload: Vec::from(captures.get(3).unwrap().as_bytes()),
        });
    }
    Err(FragmentError::InvalidFragment)
}

fn parse_tag(content: &[u8]) -> Result<InstanceTag, FragmentError> {
    let text = std::str::from_utf8(content).or(Err(FragmentError::InvalidFragment))?;
    u32::from_str_radix(text, 16).or(Err(FragmentError::InvalidFragment))
}

fn parse_counter(content: &[u8]) -> Result<u16, FragmentError> {
    let text = std::str::from_utf8(content).or(Err(FragmentError::InvalidFragment))?;
    text.parse::<u16>().or(Err(FragmentError::InvalidFragment))
}

pub fn verify(fragment: &Fragment) -> Result<(), FragmentError> {
    if fragment.total == 0 || fragment.part == 0 || fragment.part > fragment.total {
        return Err(FragmentError::InvalidFragment);
    }
    Ok(())
}

/// `Assembler` reassembles inbound fragments, buffering a partial run per
/// sender instance tag so that interleaved instances do not corrupt each
/// other.
///
/// Fragments must arrive in order: a fragment with part 1 starts a new
/// run (discarding any previous run for the tag), every other fragment
/// must continue the run it belongs to.
pub struct Assembler {
    buffers: HashMap<InstanceTag, Buffer>,
}

struct Buffer {
    total: u16,
    next: u16,
    content: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    pub fn accumulate(&mut self, fragment: Fragment) -> Result<Vec<u8>, FragmentError> {
        verify(&fragment)?;
        if fragment.part == 1 {
            let mut buffer = Buffer {
                total: fragment.total,
                next: 1,
                content: fragment.payload,
            };
            if buffer.total == 1 {
                return Ok(std::mem::take(&mut buffer.content));
            }
            self.buffers.insert(fragment.sender, buffer);
            return Err(FragmentError::IncompleteResult);
        }
        match self.buffers.get_mut(&fragment.sender) {
            Some(buffer) if fragment.total == buffer.total && fragment.part == buffer.next + 1 => {
                buffer.next = fragment.part;
                buffer.content.extend_from_slice(&fragment.payload);
                if fragment.part == fragment.total {
                    let buffer = self
                        .buffers
                        .remove(&fragment.sender)
                        .expect("BUG: buffer present a moment ago");
                    Ok(buffer.content)
                } else {
                    Err(FragmentError::IncompleteResult)
                }
            }
            _ => {
                // out-of-order or mismatching fragment: discard the run
                self.buffers.remove(&fragment.sender);
                Err(FragmentError::InvalidFragment)
            }
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// `fragment` splits an OTR-encoded message into fragments that each fit
/// in `max_size` transport bytes. A message that already fits is returned
/// as a single unfragmented frame.
pub fn fragment(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    max_size: usize,
    message: &[u8],
) -> Result<Vec<Vec<u8>>, OTRError> {
    if message.len() <= max_size {
        return Ok(vec![Vec::from(message)]);
    }
    // The fixed overhead excludes the decimal index digits; their width is
    // searched for a consistent solution, as the number of fragments
    // depends on the payload capacity and vice versa.
    let base = match version {
        // b"?OTR|" + 8 hex + b"|" + 8 hex + b"," .. b"," .. b"," payload b","
        Version::V3 => 26,
        // b"?OTR," .. b"," .. b"," payload b","
        Version::V2 => 8,
        Version::Unsupported(_) => panic!("BUG: unsupported version"),
    };
    let mut selected: Option<(usize, usize)> = None;
    for digits in 1..=5usize {
        let overhead = base + 2 * digits;
        if max_size <= overhead {
            continue;
        }
        let capacity = max_size - overhead;
        let count = (message.len() + capacity - 1) / capacity;
        if count <= MAX_FRAGMENTS && count < 10usize.pow(digits as u32) {
            selected = Some((capacity, count));
            break;
        }
    }
    let (capacity, count) = selected.ok_or(OTRError::ProtocolViolation(
        "Maximum fragment size is too small to fragment this message.",
    ))?;
    let mut fragments = Vec::with_capacity(count);
    for (index, chunk) in message.chunks(capacity).enumerate() {
        let mut frame = match version {
            Version::V3 => format!(
                "?OTR|{:08x}|{:08x},{},{},",
                sender,
                receiver,
                index + 1,
                count
            )
            .into_bytes(),
            Version::V2 => format!("?OTR,{},{},", index + 1, count).into_bytes(),
            Version::Unsupported(_) => unreachable!(),
        };
        frame.extend_from_slice(chunk);
        frame.push(b',');
        fragments.push(frame);
    }
    assert_eq!(count, fragments.len());
    Ok(fragments)
}
