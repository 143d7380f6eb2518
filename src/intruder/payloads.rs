//! Payload sets, insertion positions and variation generation

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::AttackMode;
use crate::error::ValidationError;
use crate::http::HttpRequest;

/// Part of the base request a position points into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum PositionLocation {
    Url,
    Body,
    /// Value of the first header with this name
    Header(String),
}

impl std::fmt::Display for PositionLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionLocation::Url => f.write_str("url"),
            PositionLocation::Body => f.write_str("body"),
            PositionLocation::Header(name) => write!(f, "header {}", name),
        }
    }
}

/// Position in a request where payload will be injected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadPosition {
    pub location: PositionLocation,
    /// Start byte offset, inclusive
    pub start: usize,
    /// End byte offset, exclusive
    pub end: usize,
}

impl PayloadPosition {
    pub fn new(location: PositionLocation, start: usize, end: usize) -> Self {
        Self { location, start, end }
    }

    /// Position covering the first occurrence of `needle` in the URL
    pub fn in_url(request: &HttpRequest, needle: &str) -> Option<Self> {
        let start = request.url.find(needle)?;
        Some(Self::new(PositionLocation::Url, start, start + needle.len()))
    }

    /// Position covering the first occurrence of `needle` in the body
    pub fn in_body(request: &HttpRequest, needle: &str) -> Option<Self> {
        let needle = needle.as_bytes();
        let start = request.body.windows(needle.len()).position(|w| w == needle)?;
        Some(Self::new(PositionLocation::Body, start, start + needle.len()))
    }
}

/// A set of payloads for fuzzing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSet {
    /// Name of the payload set
    pub name: String,
    /// List of payloads
    pub payloads: Vec<String>,
}

impl PayloadSet {
    pub fn new(name: &str, payloads: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            payloads,
        }
    }

    /// Load payloads from a wordlist file, skipping blanks and `#` comments
    pub fn from_file(name: &str, path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open wordlist: {}", path.display()))?;
        let reader = BufReader::new(file);

        let payloads: Vec<String> = reader
            .lines()
            .map_while(|line| line.ok())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        Ok(Self::new(name, payloads))
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

/// One concrete request to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
    pub index: usize,
    /// Payload per position; `None` keeps the original text
    pub payloads: Vec<Option<String>>,
    pub request: HttpRequest,
}

/// Check that every position lies inside its location on a character
/// boundary and that positions in the same location do not overlap
pub fn validate_positions(template: &HttpRequest, positions: &[PayloadPosition]) -> Result<(), ValidationError> {
    for (index, pos) in positions.iter().enumerate() {
        let out_of_range = || ValidationError::PositionOutOfRange {
            index,
            start: pos.start,
            end: pos.end,
            location: pos.location.to_string(),
        };

        if pos.start > pos.end {
            return Err(out_of_range());
        }
        let valid = match &pos.location {
            PositionLocation::Url => text_range_ok(&template.url, pos.start, pos.end),
            PositionLocation::Body => pos.end <= template.body.len(),
            PositionLocation::Header(name) => template
                .headers
                .get(name)
                .map(|v| text_range_ok(v, pos.start, pos.end))
                .unwrap_or(false),
        };
        if !valid {
            return Err(out_of_range());
        }
    }

    for (i, a) in positions.iter().enumerate() {
        for (j, b) in positions.iter().enumerate().skip(i + 1) {
            if a.location == b.location && a.start < b.end && b.start < a.end {
                return Err(ValidationError::OverlappingPositions {
                    first: i,
                    second: j,
                    location: a.location.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn text_range_ok(text: &str, start: usize, end: usize) -> bool {
    end <= text.len() && text.is_char_boundary(start) && text.is_char_boundary(end)
}

/// Payload assignments per variation, one slot per position
pub fn combinations(position_count: usize, sets: &[PayloadSet], mode: AttackMode) -> Vec<Vec<Option<String>>> {
    // Positions past the last set (and empty sets) keep their original text;
    // sets past the last position have nothing to fill
    let sets = &sets[..sets.len().min(position_count)];
    let set_for = |i: usize| sets.get(i).filter(|s| !s.is_empty());
    let Some(first) = sets.iter().find(|s| !s.is_empty()) else {
        return Vec::new();
    };

    match mode {
        AttackMode::Sniper => {
            let mut out = Vec::new();
            for pos in 0..position_count {
                let set = set_for(pos).unwrap_or(first);
                for payload in &set.payloads {
                    let mut values = vec![None; position_count];
                    values[pos] = Some(payload.clone());
                    out.push(values);
                }
            }
            out
        }
        AttackMode::BatteringRam => first
            .payloads
            .iter()
            .map(|payload| vec![Some(payload.clone()); position_count])
            .collect(),
        AttackMode::Pitchfork => {
            let rounds = sets.iter().map(PayloadSet::len).max().unwrap_or(0);
            (0..rounds)
                .map(|round| {
                    (0..position_count)
                        .map(|pos| set_for(pos).map(|s| s.payloads[round % s.len()].clone()))
                        .collect()
                })
                .collect()
        }
        AttackMode::ClusterBomb => {
            let mut out: Vec<Vec<Option<String>>> = vec![vec![None; position_count]];
            for (set_index, set) in sets.iter().enumerate().filter(|(_, s)| !s.is_empty()) {
                let mut next = Vec::with_capacity(out.len() * set.len());
                for existing in &out {
                    for payload in &set.payloads {
                        let mut values = existing.clone();
                        values[set_index] = Some(payload.clone());
                        next.push(values);
                    }
                }
                out = next;
            }
            out
        }
    }
}

/// Build a request with the given payloads substituted
pub fn substitute(template: &HttpRequest, positions: &[PayloadPosition], values: &[Option<String>]) -> HttpRequest {
    let mut request = template.clone();

    // Apply from the highest offset down so earlier offsets stay valid
    let mut edits: Vec<(&PayloadPosition, &str)> = positions
        .iter()
        .zip(values)
        .filter_map(|(pos, value)| value.as_deref().map(|v| (pos, v)))
        .collect();
    edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));

    for (pos, payload) in edits {
        let range = pos.start..pos.end;
        match &pos.location {
            PositionLocation::Url => request.url.replace_range(range, payload),
            PositionLocation::Body => {
                request.body.splice(range, payload.bytes());
            }
            PositionLocation::Header(name) => {
                if let Some(value) = request.headers.get_mut(name) {
                    value.replace_range(range, payload);
                }
            }
        }
    }
    request
}

/// Validate inputs and produce the full variation list
pub fn generate(
    template: &HttpRequest,
    positions: &[PayloadPosition],
    sets: &[PayloadSet],
    mode: AttackMode,
) -> Result<Vec<Variation>, ValidationError> {
    if positions.is_empty() {
        return Err(ValidationError::NoPositions);
    }
    if sets.iter().take(positions.len()).all(PayloadSet::is_empty) {
        return Err(ValidationError::NoPayloads);
    }
    validate_positions(template, positions)?;

    Ok(combinations(positions.len(), sets, mode)
        .into_iter()
        .enumerate()
        .map(|(index, payloads)| Variation {
            index,
            request: substitute(template, positions, &payloads),
            payloads,
        })
        .collect())
}
