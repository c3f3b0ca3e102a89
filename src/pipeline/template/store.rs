//! Versioned, per-client template persistence.
//!
//! Layout on disk: `<root>/<client>/<client>_v<N>.json`. Flat `<root>/<id>.json`
//! files from older installations are readable but never written. Versions
//! are only ever added; an existing version file is never overwritten.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::types::{
    format_template_id, parse_template_id, safe_client_id, LegacyProfile, ReferenceFingerprint,
    TemplateProfile, Zone, ZoneDraft, ZoneId,
};
use super::TemplateError;
use crate::pipeline::extraction::{PdfEngine, SkippedZone, ZoneExtractor, ZoneInstance};
use crate::pipeline::layout::classify_document;

/// A source document that contributed nothing to a multi-source save.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSource {
    pub source_index: usize,
    pub reason: String,
}

/// Result of a successful save.
#[derive(Debug, Clone)]
pub struct SavedTemplate {
    pub profile: TemplateProfile,
    pub path: PathBuf,
    pub skipped_zones: Vec<SkippedZone>,
    pub skipped_sources: Vec<SkippedSource>,
}

/// Zones and fingerprints captured from one reference document.
struct CapturedSource {
    zones: Vec<Zone>,
    fingerprints: Vec<ReferenceFingerprint>,
    skipped: Vec<SkippedZone>,
}

pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, TemplateError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn client_dir(&self, client: &str) -> PathBuf {
        self.root.join(client)
    }

    fn versioned_path(&self, client: &str, version: u32) -> PathBuf {
        self.client_dir(client)
            .join(format!("{}.json", format_template_id(client, version)))
    }

    fn legacy_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Clients with at least a directory in the store, sorted.
    pub fn list_clients(&self) -> Result<Vec<String>, TemplateError> {
        let mut clients = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    clients.push(name.to_string());
                }
            }
        }
        clients.sort();
        Ok(clients)
    }

    /// Persisted version numbers for a client, ascending.
    pub fn list_versions(&self, client: &str) -> Result<Vec<u32>, TemplateError> {
        let client = safe_client_id(client);
        let dir = self.client_dir(&client);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((c, v)) = parse_template_id(stem) {
                if c == client {
                    versions.push(v);
                }
            }
        }
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    /// Highest stored version, or 0 when the client has none.
    pub fn latest_version_number(&self, client: &str) -> Result<u32, TemplateError> {
        Ok(self.list_versions(client)?.last().copied().unwrap_or(0))
    }

    pub fn latest_version_id(&self, client: &str) -> Result<Option<String>, TemplateError> {
        let n = self.latest_version_number(client)?;
        Ok((n > 0).then(|| format_template_id(&safe_client_id(client), n)))
    }

    pub fn next_version_id(&self, client: &str) -> Result<String, TemplateError> {
        let n = self.latest_version_number(client)?;
        Ok(format_template_id(&safe_client_id(client), n + 1))
    }

    /// Save a new version from a single reference document.
    ///
    /// Drafts are filtered to the document's layout, fingerprinted, and
    /// stored under the client's next version. Individually invalid zones are
    /// skipped and reported.
    pub fn save_profile(
        &self,
        client: &str,
        reference: &Path,
        drafts: &[ZoneDraft],
        image_map: &BTreeMap<ZoneId, String>,
        engine: &dyn PdfEngine,
        extractor: &ZoneExtractor,
    ) -> Result<SavedTemplate, TemplateError> {
        if drafts.is_empty() {
            return Err(TemplateError::NoZonesProvided);
        }
        let indexed: Vec<(ZoneId, &ZoneDraft)> =
            drafts.iter().enumerate().map(|(i, d)| (ZoneId(i), d)).collect();
        let captured = capture_source(reference, &indexed, 0, engine, extractor)?;
        let (profile, path) = self.persist(
            client,
            captured.zones,
            captured.fingerprints,
            image_map,
        )?;
        Ok(SavedTemplate {
            profile,
            path,
            skipped_zones: captured.skipped,
            skipped_sources: Vec::new(),
        })
    }

    /// Save a new version whose zones come from several reference documents.
    ///
    /// Drafts are grouped by `source_index`; each source is opened, classified
    /// and fingerprinted once. A failing source is skipped as a whole. The save
    /// fails only when no source contributes a zone.
    pub fn save_profile_multi(
        &self,
        client: &str,
        drafts: &[ZoneDraft],
        sources: &BTreeMap<usize, PathBuf>,
        image_map: &BTreeMap<ZoneId, String>,
        engine: &dyn PdfEngine,
        extractor: &ZoneExtractor,
    ) -> Result<SavedTemplate, TemplateError> {
        if drafts.is_empty() {
            return Err(TemplateError::NoZonesProvided);
        }

        let mut groups: BTreeMap<usize, Vec<(ZoneId, &ZoneDraft)>> = BTreeMap::new();
        for (i, draft) in drafts.iter().enumerate() {
            groups.entry(draft.source_index).or_default().push((ZoneId(i), draft));
        }

        let mut zones = Vec::new();
        let mut fingerprints = Vec::new();
        let mut skipped_zones = Vec::new();
        let mut skipped_sources = Vec::new();
        let mut any_layout_match = false;

        for (source_index, group) in groups {
            let Some(path) = sources.get(&source_index).filter(|p| p.is_file()) else {
                warn!(source_index, "Missing source document; skipping its zones");
                skipped_sources.push(SkippedSource {
                    source_index,
                    reason: "missing source document".into(),
                });
                continue;
            };
            match capture_source(path, &group, source_index, engine, extractor) {
                Ok(captured) => {
                    any_layout_match = true;
                    zones.extend(captured.zones);
                    fingerprints.extend(captured.fingerprints);
                    skipped_zones.extend(captured.skipped);
                }
                Err(e) => {
                    if matches!(e, TemplateError::NoValidZones) {
                        any_layout_match = true;
                    }
                    warn!(source_index, source = %path.display(), error = %e, "Source contributed no zones");
                    skipped_sources.push(SkippedSource {
                        source_index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if zones.is_empty() {
            return Err(if any_layout_match {
                TemplateError::NoValidZones
            } else {
                TemplateError::NoMatchingZones {
                    layout: "no source document matched".into(),
                }
            });
        }

        zones.sort_by_key(|z: &Zone| z.zone_id);
        fingerprints.sort_by_key(|f: &ReferenceFingerprint| f.zone_id);
        let (profile, path) = self.persist(client, zones, fingerprints, image_map)?;
        Ok(SavedTemplate {
            profile,
            path,
            skipped_zones,
            skipped_sources,
        })
    }

    /// Load a profile by id, trying the versioned location then the legacy one.
    pub fn load_profile(&self, id: &str) -> Result<TemplateProfile, TemplateError> {
        let mut checked = Vec::new();
        if let Some((client, version)) = parse_template_id(id) {
            checked.push(self.versioned_path(&client, version));
        }
        checked.push(self.legacy_path(id));

        let Some(path) = checked.iter().find(|p| p.is_file()) else {
            return Err(TemplateError::TemplateNotFound {
                id: id.to_string(),
                checked,
            });
        };

        let bytes = std::fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let profile = if value.get("zones").is_some() {
            serde_json::from_value::<TemplateProfile>(value)?
        } else {
            let modified: DateTime<Utc> = std::fs::metadata(path)?.modified()?.into();
            serde_json::from_value::<LegacyProfile>(value)?.into_profile(id, modified)
        };

        if !profile.is_consistent() {
            return Err(TemplateError::Inconsistent(id.to_string()));
        }
        Ok(profile)
    }

    /// Write a new version atomically without ever replacing an existing file.
    fn persist(
        &self,
        client: &str,
        zones: Vec<Zone>,
        fingerprints: Vec<ReferenceFingerprint>,
        image_map: &BTreeMap<ZoneId, String>,
    ) -> Result<(TemplateProfile, PathBuf), TemplateError> {
        let client = safe_client_id(client);
        let version = self.latest_version_number(&client)? + 1;
        let id = format_template_id(&client, version);
        let image_map = image_map
            .iter()
            .filter(|(zone_id, _)| zones.iter().any(|z| z.zone_id == **zone_id))
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let profile = TemplateProfile {
            id: id.clone(),
            client: client.clone(),
            version,
            created_at: Utc::now(),
            zones,
            fingerprints,
            image_map,
        };

        let dir = self.client_dir(&client);
        std::fs::create_dir_all(&dir)?;
        let path = self.versioned_path(&client, version);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&profile)?)?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                TemplateError::VersionConflict(id.clone())
            } else {
                TemplateError::Io(e.error)
            }
        })?;

        info!(
            template = %id,
            zones = profile.zones.len(),
            images = profile.image_map.len(),
            path = %path.display(),
            "Saved template version"
        );
        Ok((profile, path))
    }
}

/// Open one reference document, filter the drafts to its layout and
/// fingerprint the survivors.
fn capture_source(
    path: &Path,
    drafts: &[(ZoneId, &ZoneDraft)],
    source_index: usize,
    engine: &dyn PdfEngine,
    extractor: &ZoneExtractor,
) -> Result<CapturedSource, TemplateError> {
    let doc = engine.open(path)?;
    let layout = classify_document(doc.as_ref())?;
    info!(source = %path.display(), layout = %layout, "Reference layout detected");

    let active: Vec<&(ZoneId, &ZoneDraft)> = drafts
        .iter()
        .filter(|(_, d)| layout.admits(d.paper, d.orientation))
        .collect();
    if active.is_empty() {
        return Err(TemplateError::NoMatchingZones {
            layout: layout.to_string(),
        });
    }

    let instances: Vec<ZoneInstance> = active
        .iter()
        .map(|(zone_id, d)| ZoneInstance {
            zone_id: *zone_id,
            page: d.page,
            bbox: d.bbox,
        })
        .collect();
    let extraction = extractor.extract(doc.as_ref(), &instances)?;
    if extraction.fingerprints.is_empty() {
        return Err(TemplateError::NoValidZones);
    }
    if !extraction.skipped.is_empty() {
        warn!(
            source = %path.display(),
            skipped = extraction.skipped.len(),
            "Zones skipped while capturing template"
        );
    }

    let source_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
    let mut zones = Vec::with_capacity(extraction.fingerprints.len());
    let mut fingerprints = Vec::with_capacity(extraction.fingerprints.len());
    for fp in extraction.fingerprints {
        let Some((_, draft)) = active.iter().find(|(id, _)| *id == fp.zone_id) else {
            continue;
        };
        zones.push(Zone {
            zone_id: fp.zone_id,
            page: fp.page,
            bbox: fp.bbox,
            paper: draft.paper,
            orientation: draft.orientation,
            source_index,
            source_name: source_name.clone(),
        });
        fingerprints.push(ReferenceFingerprint {
            zone_id: fp.zone_id,
            text: fp.text,
            image_hash: fp.image_hash,
        });
    }

    Ok(CapturedSource {
        zones,
        fingerprints,
        skipped: extraction.skipped,
    })
}
