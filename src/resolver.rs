// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::dataset::Domain;
use crate::{PureResult, TensorError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const ATTRIBUTE_FILE: &str = "attributes_00.csv";

/// Dataset stage. Anything other than the two known stages is rejected
/// before touching the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Train,
    Test,
}

impl Stage {
    pub fn parse(token: &str) -> PureResult<Self> {
        match token {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            other => Err(TensorError::InvalidStage {
                stage: other.to_string(),
            }),
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

/// Fields recovered from a recording filename of the form
/// `section_<id>_<domain>_<stage>_<condition>_..._<tags>.wav`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipName {
    pub section: String,
    pub domain: Domain,
    pub normal: bool,
    pub attribute: String,
}

/// Lenient filename parsing: files that are not `.wav` or that lack the
/// expected token structure are skipped, not treated as errors. Malformed
/// names silently drop out of the dataset by policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ClipName),
    Skip,
}

pub fn parse_clip_name(file_name: &str) -> ParseOutcome {
    let Some(stem) = file_name.strip_suffix(".wav") else {
        return ParseOutcome::Skip;
    };
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 7 {
        return ParseOutcome::Skip;
    }
    let Ok(domain) = Domain::parse(parts[2]) else {
        return ParseOutcome::Skip;
    };
    ParseOutcome::Parsed(ClipName {
        section: parts[1].to_string(),
        domain,
        normal: parts[4] == "normal",
        attribute: parts[6..].join("_"),
    })
}

/// One row of the sidecar attribute table: a relative recording path plus
/// the values of its parameter columns.
#[derive(Debug, Clone)]
pub struct AttributeRow {
    pub file_name: String,
    pub values: Vec<String>,
}

/// Per-machine directory reader. Attribute metadata comes from
/// `attributes_00.csv` when present; otherwise the reader degrades to plain
/// directory listings.
#[derive(Debug)]
pub struct MachineReader {
    machine_name: String,
    directory_path: PathBuf,
    data_path: PathBuf,
    attributes: Option<Vec<AttributeRow>>,
}

impl MachineReader {
    pub fn new(machine_name: impl Into<String>, directory_path: impl Into<PathBuf>) -> Self {
        let machine_name = machine_name.into();
        let directory_path = directory_path.into();
        let data_path = directory_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| directory_path.clone());
        let attributes = Self::read_attributes(&directory_path, &machine_name);
        Self {
            machine_name,
            directory_path,
            data_path,
            attributes,
        }
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    pub fn has_attributes(&self) -> bool {
        self.attributes.is_some()
    }

    fn read_attributes(directory_path: &Path, machine_name: &str) -> Option<Vec<AttributeRow>> {
        let csv_path = directory_path.join(ATTRIBUTE_FILE);
        let Ok(content) = fs::read_to_string(&csv_path) else {
            warn!(machine = machine_name, "no attribute file found");
            return None;
        };
        let mut lines = content.lines();
        let header = lines.next()?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let file_column = columns.iter().position(|col| *col == "file_name")?;
        // Parameter value columns by convention carry a 'v' in their header.
        let value_columns: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter_map(|(index, col)| {
                (index != file_column && col.contains('v')).then_some(index)
            })
            .collect();

        let mut rows = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let Some(file_name) = fields.get(file_column) else {
                continue;
            };
            let values = value_columns
                .iter()
                .filter_map(|&index| fields.get(index).map(|v| v.to_string()))
                .collect();
            rows.push(AttributeRow {
                file_name: file_name.to_string(),
                values,
            });
        }
        Some(rows)
    }

    pub fn files_dir(&self, stage: Stage) -> PathBuf {
        self.directory_path.join(stage.dir_name())
    }

    fn listed_paths(&self, stage: Stage) -> PureResult<Vec<(PathBuf, Vec<String>)>> {
        let dir = self.files_dir(stage);
        let entries = fs::read_dir(&dir).map_err(|err| TensorError::IoError {
            message: format!("{}: {err}", dir.display()),
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
            .collect();
        paths.sort();
        Ok(paths.into_iter().map(|path| (path, Vec::new())).collect())
    }

    /// Recording paths plus attribute value lists for a stage.
    ///
    /// With an attribute table, rows are matched via the `/{stage}/`
    /// substring and joined onto the data root; the first row whose file is
    /// missing on disk ends collection for this machine (the table is
    /// treated as exhausted from that point on). Without a table the stage
    /// directory is listed directly and attributes are empty.
    pub fn file_paths(&self, stage: Stage) -> PureResult<Vec<(PathBuf, Vec<String>)>> {
        let Some(attributes) = &self.attributes else {
            return self.listed_paths(stage);
        };
        let needle = format!("/{}/", stage.dir_name());
        let mut collected = Vec::new();
        for row in attributes {
            if !row.file_name.contains(&needle) {
                continue;
            }
            let path = self.data_path.join(&row.file_name);
            if !path.is_file() {
                warn!(
                    machine = self.machine_name.as_str(),
                    file = row.file_name.as_str(),
                    "attribute table exhausted, stopping collection"
                );
                break;
            }
            collected.push((path, row.values.clone()));
        }
        Ok(collected)
    }
}

/// A named machine directory plus its reader.
#[derive(Debug)]
pub struct MachineEntry {
    pub name: String,
    pub path: PathBuf,
    pub reader: MachineReader,
}

/// Builds one entry per machine-type subdirectory of `root`, sorted by name
/// for reproducible iteration order.
pub fn scan_machines(root: impl AsRef<Path>) -> PureResult<Vec<MachineEntry>> {
    let root = root.as_ref();
    let entries = fs::read_dir(root).map_err(|err| TensorError::IoError {
        message: format!("{}: {err}", root.display()),
    })?;
    let mut machines = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| TensorError::IoError {
            message: err.to_string(),
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        machines.push(MachineEntry {
            reader: MachineReader::new(name.clone(), path.clone()),
            name,
            path,
        });
    }
    machines.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(machines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    #[test]
    fn stage_rejects_unknown_tokens() {
        assert_eq!(Stage::parse("train").unwrap(), Stage::Train);
        assert!(matches!(
            Stage::parse("validation"),
            Err(TensorError::InvalidStage { .. })
        ));
    }

    #[test]
    fn clip_names_parse_or_skip() {
        let parsed =
            parse_clip_name("section_00_source_train_normal_0001_p1_v1_p2_v2.wav");
        let ParseOutcome::Parsed(clip) = parsed else {
            panic!("expected parse");
        };
        assert_eq!(clip.section, "00");
        assert_eq!(clip.domain, Domain::Source);
        assert!(clip.normal);
        assert_eq!(clip.attribute, "p1_v1_p2_v2");

        assert_eq!(parse_clip_name("readme.txt"), ParseOutcome::Skip);
        assert_eq!(parse_clip_name("short_name.wav"), ParseOutcome::Skip);
    }

    #[test]
    fn reader_without_attributes_lists_wav_files() {
        let dir = tempfile::tempdir().unwrap();
        let machine = dir.path().join("fan");
        fs::create_dir_all(machine.join("train")).unwrap();
        touch(&machine.join("train/b.wav"));
        touch(&machine.join("train/a.wav"));
        touch(&machine.join("train/notes.txt"));

        let reader = MachineReader::new("fan", &machine);
        assert!(!reader.has_attributes());
        let files = reader.file_paths(Stage::Train).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].0.ends_with("a.wav"));
        assert!(files[0].1.is_empty());
    }

    #[test]
    fn reader_joins_attribute_rows_and_stops_at_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let machine = dir.path().join("valve");
        fs::create_dir_all(machine.join("train")).unwrap();
        touch(&machine.join("train/x.wav"));
        touch(&machine.join("train/y.wav"));

        let mut csv = File::create(machine.join(ATTRIBUTE_FILE)).unwrap();
        writeln!(csv, "file_name,p1,v1").unwrap();
        writeln!(csv, "valve/train/x.wav,speed,fast").unwrap();
        writeln!(csv, "valve/train/missing.wav,speed,slow").unwrap();
        writeln!(csv, "valve/train/y.wav,speed,slow").unwrap();
        drop(csv);

        let reader = MachineReader::new("valve", &machine);
        assert!(reader.has_attributes());
        let files = reader.file_paths(Stage::Train).unwrap();
        // Collection ends at the first missing file, dropping y.wav too.
        assert_eq!(files.len(), 1);
        assert!(files[0].0.ends_with("x.wav"));
        assert_eq!(files[0].1, vec!["fast".to_string()]);
    }

    #[test]
    fn scan_orders_machines_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("valve")).unwrap();
        fs::create_dir_all(dir.path().join("bearing")).unwrap();
        let machines = scan_machines(dir.path()).unwrap();
        let names: Vec<&str> = machines.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["bearing", "valve"]);
    }
}
