use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::pipeline::layout::{BBox, Orientation, PageLayout, Paper};

/// Stable identity of a zone within one client definition. Carried from capture
/// through replication, extraction and scoring so that filtering or reordering
/// a zone list never detaches a zone from its reference fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub usize);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A zone as drawn by a user, before it is validated against a reference document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDraft {
    pub page: usize,
    pub bbox: BBox,
    #[serde(default)]
    pub paper: Paper,
    #[serde(default)]
    pub orientation: Orientation,
    /// Which reference document the zone was drawn on (multi-source saves).
    #[serde(default)]
    pub source_index: usize,
}

impl ZoneDraft {
    pub fn new(page: usize, bbox: BBox, paper: Paper, orientation: Orientation) -> Self {
        Self {
            page,
            bbox,
            paper,
            orientation,
            source_index: 0,
        }
    }

    pub fn from_source(mut self, source_index: usize) -> Self {
        self.source_index = source_index;
        self
    }
}

/// A validated zone stored in a template. `bbox` is as drawn: displayed
/// frame, top-left origin, normalized, positive area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub page: usize,
    pub bbox: BBox,
    pub paper: Paper,
    pub orientation: Orientation,
    #[serde(default)]
    pub source_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

impl Zone {
    pub fn applies_to(&self, layout: &PageLayout) -> bool {
        layout.admits(self.paper, self.orientation)
    }
}

/// Content captured for a zone on the reference document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFingerprint {
    pub zone_id: ZoneId,
    pub text: String,
    pub image_hash: String,
}

/// One immutable template version for a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateProfile {
    pub id: String,
    pub client: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub zones: Vec<Zone>,
    pub fingerprints: Vec<ReferenceFingerprint>,
    /// Zone id to image reference (a path, relative to the image root or absolute).
    #[serde(default)]
    pub image_map: BTreeMap<ZoneId, String>,
}

impl TemplateProfile {
    pub fn fingerprint(&self, zone_id: ZoneId) -> Option<&ReferenceFingerprint> {
        self.fingerprints.iter().find(|f| f.zone_id == zone_id)
    }

    pub fn zone(&self, zone_id: ZoneId) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }

    /// Zones applicable to a document layout, in stored order.
    pub fn zones_for(&self, layout: &PageLayout) -> Vec<&Zone> {
        self.zones.iter().filter(|z| z.applies_to(layout)).collect()
    }

    /// Every zone has exactly one fingerprint and no id repeats.
    pub fn is_consistent(&self) -> bool {
        if self.zones.len() != self.fingerprints.len() {
            return false;
        }
        let mut seen = std::collections::BTreeSet::new();
        self.zones
            .iter()
            .all(|z| seen.insert(z.zone_id) && self.fingerprint(z.zone_id).is_some())
    }
}

// ──────────────────────────────────────────────
// Legacy profile layout
// ──────────────────────────────────────────────

/// Profiles written before zone ids existed: parallel `rectangles` and
/// `contents` arrays correlated by position, image map keyed by that position.
#[derive(Debug, Deserialize)]
pub(crate) struct LegacyProfile {
    #[serde(default)]
    rectangles: Vec<LegacyRectangle>,
    #[serde(default)]
    contents: Vec<LegacyContent>,
    #[serde(default)]
    image_map: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRectangle {
    #[serde(default)]
    page: usize,
    bbox: Vec<f32>,
    #[serde(default)]
    paper: Paper,
    #[serde(default)]
    orientation: Orientation,
    #[serde(default)]
    source_index: usize,
    #[serde(default)]
    source_pdf: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyContent {
    #[serde(default)]
    text: String,
    #[serde(default)]
    image_hash: String,
}

impl LegacyProfile {
    /// Convert to the current model, assigning positional zone ids. Rectangles
    /// whose bbox is not four numbers are dropped along with their content.
    pub(crate) fn into_profile(self, id: &str, modified: DateTime<Utc>) -> TemplateProfile {
        let (client, version) = parse_template_id(id).unwrap_or_else(|| (id.to_string(), 0));
        let mut zones = Vec::new();
        let mut fingerprints = Vec::new();
        for (idx, (rect, content)) in self.rectangles.into_iter().zip(self.contents).enumerate() {
            let Some(bbox) = BBox::from_slice(&rect.bbox) else {
                tracing::warn!(template = id, index = idx, "Dropping legacy zone with malformed bbox");
                continue;
            };
            let zone_id = ZoneId(idx);
            zones.push(Zone {
                zone_id,
                page: rect.page,
                bbox,
                paper: rect.paper,
                orientation: rect.orientation,
                source_index: rect.source_index,
                source_name: rect.source_pdf,
            });
            fingerprints.push(ReferenceFingerprint {
                zone_id,
                text: content.text,
                image_hash: content.image_hash,
            });
        }
        let image_map = self
            .image_map
            .into_iter()
            .filter_map(|(k, v)| k.trim().parse::<usize>().ok().map(|i| (ZoneId(i), v)))
            .collect();
        TemplateProfile {
            id: id.to_string(),
            client,
            version,
            created_at: modified,
            zones,
            fingerprints,
            image_map,
        }
    }
}

// ──────────────────────────────────────────────
// Identifiers
// ──────────────────────────────────────────────

static TEMPLATE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<client>[A-Za-z0-9_\-]+)_v(?P<ver>\d+)$").unwrap());

/// Split `<client>_v<N>` into its parts. Anything else is not a versioned id.
pub fn parse_template_id(id: &str) -> Option<(String, u32)> {
    let caps = TEMPLATE_ID.captures(id)?;
    let version = caps.name("ver")?.as_str().parse().ok()?;
    Some((caps.name("client")?.as_str().to_string(), version))
}

pub fn format_template_id(client: &str, version: u32) -> String {
    format!("{client}_v{version}")
}

/// Normalize a free-form client name into a storage-safe id.
pub fn safe_client_id(name: &str) -> String {
    let id: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if id.is_empty() {
        "template".to_string()
    } else {
        id
    }
}
