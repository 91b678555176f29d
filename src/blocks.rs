//! Track block map: polygonal regions of the rail map, each addressing one
//! LED on the downstream display board.
//!
//! Blocks are loaded once at startup from a KML export of the rail map and
//! never mutated afterwards. Placemark names carry the block metadata and
//! the optional `<description>` rows define station platforms.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use tracing::{debug, warn};

use crate::geometry::{bearing_difference, point_in_polygon};

/// A platform within a station block. Platforms refine which LED a train
/// inside the station polygon should light up.
#[derive(Debug, Clone, PartialEq)]
pub struct Platform {
    pub block_number: i32,
    /// GTFS stop identifiers served from this platform. Empty when unknown.
    pub stop_ids: Vec<String>,
    pub is_default: bool,
    /// Approach bearing in degrees, normalized to [0, 360).
    pub bearing: Option<f64>,
    /// Route-id substrings allowed on this platform. Empty means any.
    pub routes: Vec<String>,
}

/// One polygonal region of the rail map. Immutable after load.
#[derive(Debug, Clone)]
pub struct TrackBlock {
    pub block_number: i32,
    /// Paired LED used when two trains occupy the block at once.
    pub alt_block: Option<i32>,
    pub name: String,
    /// Blocks named with a word (station bodies) win polygon-overlap ties.
    pub priority: bool,
    /// Route-id substrings allowed in this block. Empty means any.
    pub routes: Vec<String>,
    /// `(lat, lon)` vertices.
    pub polygon: Vec<(f64, f64)>,
    pub platforms: Vec<Platform>,
}

impl TrackBlock {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        point_in_polygon(lat, lon, &self.polygon)
    }

    /// Route filters match by substring inclusion, not equality: a block
    /// restricted to `EAST` admits route `EAST-201`.
    pub fn allows_route(&self, route: &str) -> bool {
        self.routes.is_empty() || self.routes.iter().any(|r| route.contains(r.as_str()))
    }
}

/// Ordered block collection. Iteration order is a contract: blocks with
/// route restrictions come first, then priority blocks, and the original
/// file order is preserved within each group. The assignment search stops
/// at the first matching block, so this order decides overlap ties.
#[derive(Debug, Clone, Default)]
pub struct TrackBlockMap {
    blocks: Vec<TrackBlock>,
    by_number: HashMap<i32, usize>,
}

impl TrackBlockMap {
    pub fn new(mut blocks: Vec<TrackBlock>) -> Self {
        // Stable sort keeps insertion order within each group.
        blocks.sort_by_key(|b| (b.routes.is_empty(), !b.priority));
        let by_number = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.block_number, i))
            .collect();
        Self { blocks, by_number }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Canonical-order iteration.
    pub fn iter(&self) -> impl Iterator<Item = &TrackBlock> {
        self.blocks.iter()
    }

    pub fn get(&self, block_number: i32) -> Option<&TrackBlock> {
        self.by_number.get(&block_number).map(|&i| &self.blocks[i])
    }

    /// Resolves a block number that may be an alt block or a platform
    /// number back to the block whose polygon defines it.
    pub fn resolve(&self, block_number: i32) -> Option<&TrackBlock> {
        self.get(block_number).or_else(|| {
            self.blocks.iter().find(|b| {
                b.alt_block == Some(block_number)
                    || b.platforms.iter().any(|p| p.block_number == block_number)
            })
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no placemarks found in {0}")]
    EmptyKml(String),
}

/// Loads the track block map from a KML file.
pub fn load_track_blocks(path: &Path) -> Result<TrackBlockMap, LoadError> {
    let content = std::fs::read_to_string(path)?;
    let map = parse_kml(&content);
    if map.is_empty() {
        return Err(LoadError::EmptyKml(path.display().to_string()));
    }
    Ok(map)
}

struct NamePatterns {
    digits: Regex,
    alt: Regex,
    routes: Regex,
    letters: Regex,
}

impl NamePatterns {
    fn new() -> Self {
        Self {
            digits: Regex::new(r"\d+").expect("valid regex"),
            alt: Regex::new(r"\+(\d+)").expect("valid regex"),
            routes: Regex::new(r"\[([^\]]*)\]").expect("valid regex"),
            letters: Regex::new(r"[A-Za-z]{3,}").expect("valid regex"),
        }
    }
}

/// Parses the placemark list out of KML text. Geofabrik-style KML is simple
/// enough that tag scanning is sufficient; no attribute handling is needed.
pub fn parse_kml(content: &str) -> TrackBlockMap {
    let patterns = NamePatterns::new();
    let mut blocks = Vec::new();
    let mut rest = content;

    while let Some(start) = rest.find("<Placemark") {
        let tail = &rest[start..];
        let Some(end) = tail.find("</Placemark>") else {
            break;
        };
        if let Some(block) = parse_placemark(&tail[..end], &patterns) {
            blocks.push(block);
        }
        rest = &tail[end + "</Placemark>".len()..];
    }

    TrackBlockMap::new(blocks)
}

fn parse_placemark(placemark: &str, patterns: &NamePatterns) -> Option<TrackBlock> {
    let name = tag_text(placemark, "name").unwrap_or_default();

    let Some(number_match) = patterns.digits.find(name) else {
        warn!(name, "placemark has no block number, skipping");
        return None;
    };
    let block_number: i32 = number_match.as_str().parse().ok()?;

    let alt_block = patterns
        .alt
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    let routes = patterns
        .routes
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| split_route_list(m.as_str()))
        .unwrap_or_default();

    let priority = patterns.letters.is_match(name);

    let polygon = tag_text(placemark, "coordinates")
        .map(parse_coordinates)
        .unwrap_or_default();
    if polygon.len() < 3 {
        warn!(name, block_number, "placemark polygon has fewer than 3 vertices");
    }

    let platforms = tag_text(placemark, "description")
        .map(|d| parse_platforms(d, block_number))
        .unwrap_or_default();
    validate_platforms(block_number, &platforms);

    Some(TrackBlock {
        block_number,
        alt_block,
        name: name.to_string(),
        priority,
        routes,
        polygon,
        platforms,
    })
}

/// Extracts the text of the first `<tag>…</tag>` span, unwrapping CDATA.
fn tag_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(strip_cdata(xml[start..end].trim()))
}

fn strip_cdata(text: &str) -> &str {
    text.strip_prefix("<![CDATA[")
        .and_then(|t| t.strip_suffix("]]>"))
        .map(str::trim)
        .unwrap_or(text)
}

/// KML coordinates are whitespace-separated `lon,lat[,alt]` triples.
fn parse_coordinates(text: &str) -> Vec<(f64, f64)> {
    let mut vertices = Vec::new();
    for triple in text.split_whitespace() {
        let mut parts = triple.split(',');
        let lon = parts.next().and_then(|v| v.parse::<f64>().ok());
        let lat = parts.next().and_then(|v| v.parse::<f64>().ok());
        if let (Some(lon), Some(lat)) = (lon, lat) {
            vertices.push((lat, lon));
        } else {
            debug!(triple, "ignoring malformed coordinate triple");
        }
    }
    vertices
}

/// Each description line defines one platform. Fields are comma-separated
/// except inside `[...]`, and detected by pattern rather than position
/// (apart from the leading block number).
fn parse_platforms(description: &str, parent_block: i32) -> Vec<Platform> {
    let mut platforms = Vec::new();

    for line in description.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = split_fields(line);
        let Some(first) = fields.first() else {
            continue;
        };
        let Ok(block_number) = first.parse::<i32>() else {
            warn!(parent_block, line, "platform line does not start with a block number");
            continue;
        };

        let mut platform = Platform {
            block_number,
            stop_ids: Vec::new(),
            is_default: false,
            bearing: None,
            routes: Vec::new(),
        };

        for field in &fields[1..] {
            if field == "Default" {
                platform.is_default = true;
            } else if let Some(deg) = field.strip_suffix("deg") {
                match deg.trim().parse::<f64>() {
                    Ok(value) => platform.bearing = Some(value.rem_euclid(360.0)),
                    Err(_) => warn!(parent_block, field = %field, "unparseable platform bearing"),
                }
            } else if field.starts_with('[') && field.ends_with(']') {
                platform.routes = split_route_list(&field[1..field.len() - 1]);
            } else if field.starts_with('"') || field.contains(';') {
                platform.stop_ids = field
                    .trim_matches('"')
                    .split(';')
                    .map(|s| s.trim().trim_matches('"').to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else {
                debug!(parent_block, field = %field, "ignoring unrecognized platform field");
            }
        }

        platforms.push(platform);
    }

    platforms
}

/// Comma split that leaves `[...]` route lists intact.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for c in line.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields.retain(|f| !f.is_empty());
    fields
}

fn split_route_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

/// Platform bearings within one block must describe the same track axis:
/// equal or opposite. Duplicate platform numbers are flagged as well.
fn validate_platforms(block_number: i32, platforms: &[Platform]) {
    for (i, a) in platforms.iter().enumerate() {
        for b in &platforms[i + 1..] {
            if a.block_number == b.block_number {
                warn!(
                    block_number,
                    platform = a.block_number,
                    "duplicate platform number within block"
                );
            }
            if let (Some(ba), Some(bb)) = (a.bearing, b.bearing) {
                let diff = bearing_difference(ba, bb);
                if diff > 1e-6 && (diff - 180.0).abs() > 1e-6 {
                    warn!(
                        block_number,
                        bearing_a = ba,
                        bearing_b = bb,
                        "platform bearings are neither equal nor opposite"
                    );
                }
            }
        }
    }
}
