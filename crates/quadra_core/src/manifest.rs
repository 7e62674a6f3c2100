use crate::consts::{NodeId, SegmentKind};
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One committed phase of a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseRec {
    pub phase: u64,
    pub kind: SegmentKind,
    #[serde(with = "path_serde")]
    pub path: PathBuf,
    /// Entries in the segment.
    #[serde(default)]
    pub count: u64,
    /// Next node id to hand out (value pool only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<NodeId>,
}

mod path_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(p: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&p.to_string_lossy())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
        let s = String::deserialize(d)?;
        Ok(PathBuf::from(s))
    }
}

/// Participant manifest: the committed phases it still retains, oldest first.
/// Segment paths are relative to the store directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub phases: Vec<PhaseRec>,

    /// Highest phase number ever committed; never decreases.
    #[serde(default)]
    pub last_phase: u64,
}

impl Manifest {
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        let p = dir.join(name);
        if !p.exists() {
            return Ok(Self::default());
        }
        let s = fs::read_to_string(p)?;
        let m: Manifest = serde_json::from_str(&s)?;
        Ok(m)
    }

    pub fn save_atomic(&self, dir: &Path, name: &str) -> Result<()> {
        let p = dir.join(name);
        let tmp = dir.join(format!("{name}.tmp"));
        let mut f = fs::File::create(&tmp)?;
        f.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, &p)?;
        Ok(())
    }

    pub fn phase_numbers(&self) -> Vec<u64> {
        self.phases.iter().map(|p| p.phase).collect()
    }

    pub fn latest(&self) -> Option<&PhaseRec> {
        self.phases.iter().max_by_key(|p| p.phase)
    }

    pub fn get(&self, phase: u64) -> Option<&PhaseRec> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Highest phase number ever recorded, including pruned and truncated ones.
    pub fn high_water(&self) -> u64 {
        self.last_phase.max(self.latest().map(|p| p.phase).unwrap_or(0))
    }

    /// Adds a freshly committed phase and keeps only the newest `retain`.
    /// Returns segment paths no retained phase refers to any more.
    pub fn add_phase(&mut self, rec: PhaseRec, retain: usize) -> Vec<PathBuf> {
        self.last_phase = self.last_phase.max(rec.phase);
        self.phases.push(rec);
        self.phases.sort_by_key(|p| p.phase);
        let mut dropped = Vec::new();
        while self.phases.len() > retain.max(1) {
            dropped.push(self.phases.remove(0));
        }
        self.unreferenced(dropped)
    }

    /// Forgets every phase newer than `phase` (recovery after a torn commit).
    pub fn truncate_after(&mut self, phase: u64) -> Vec<PathBuf> {
        let (keep, drop): (Vec<_>, Vec<_>) = self.phases.drain(..).partition(|p| p.phase <= phase);
        self.phases = keep;
        self.unreferenced(drop)
    }

    // unchanged participants alias the previous phase's segment
    fn unreferenced(&self, gone: Vec<PhaseRec>) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for rec in gone {
            if self.phases.iter().any(|p| p.path == rec.path) || out.contains(&rec.path) {
                continue;
            }
            out.push(rec.path);
        }
        out
    }
}

/// A participant's manifest plus the directory its segments live in.
pub struct PhaseLog {
    dir: PathBuf,
    file: &'static str,
    manifest: Manifest,
    retained: usize,
}

impl PhaseLog {
    pub fn open(dir: &Path, file: &'static str, retained: usize) -> Result<Self> {
        let manifest = Manifest::load(dir, file)?;
        Ok(Self { dir: dir.to_path_buf(), file, manifest, retained })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of a phase's segment.
    pub fn segment_path(&self, rec: &PhaseRec) -> PathBuf {
        self.dir.join(&rec.path)
    }

    /// Records a committed phase, then deletes segments that fell out of retention.
    pub fn record(&mut self, rec: PhaseRec) -> Result<()> {
        let dropped = self.manifest.add_phase(rec, self.retained);
        self.manifest.save_atomic(&self.dir, self.file)?;
        self.remove_files(dropped);
        Ok(())
    }

    /// Records `phase` as pointing at the latest phase's segment.
    pub fn alias_latest(&mut self, phase: u64) -> Result<PhaseRec> {
        let mut rec = self.manifest.latest().cloned().ok_or_else(|| {
            crate::errors::QuadError::consistency(format!("{}: nothing committed to alias", self.file))
        })?;
        rec.phase = phase;
        self.record(rec.clone())?;
        Ok(rec)
    }

    pub fn truncate_after(&mut self, phase: u64) -> Result<usize> {
        let dropped = self.manifest.truncate_after(phase);
        let n = dropped.len();
        if n > 0 {
            tracing::warn!(file = self.file, phase, dropped = n, "discarding phases newer than the recovery point");
            self.manifest.save_atomic(&self.dir, self.file)?;
            self.remove_files(dropped);
        }
        Ok(n)
    }

    fn remove_files(&self, paths: Vec<PathBuf>) {
        for p in paths {
            if let Err(e) = fs::remove_file(self.dir.join(&p)) {
                tracing::warn!(path = %p.display(), error = %e, "could not remove segment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(phase: u64) -> PhaseRec {
        PhaseRec {
            phase,
            kind: SegmentKind::Quads,
            path: PathBuf::from(format!("quads-{phase:08}.qseg")),
            count: 0,
            next_node: None,
        }
    }

    #[test]
    fn retention_and_truncation() {
        let tmp = tempdir().unwrap();
        let mut m = Manifest::load(tmp.path(), "index.manifest.json").unwrap();
        assert!(m.phases.is_empty());
        let mut pruned = Vec::new();
        for p in 1..=4 {
            pruned.extend(m.add_phase(rec(p), 3));
        }
        assert_eq!(m.phase_numbers(), vec![2, 3, 4]);
        assert_eq!(pruned, vec![PathBuf::from("quads-00000001.qseg")]);

        let gone = m.truncate_after(3);
        assert_eq!(gone, vec![PathBuf::from("quads-00000004.qseg")]);
        m.save_atomic(tmp.path(), "index.manifest.json").unwrap();

        let back = Manifest::load(tmp.path(), "index.manifest.json").unwrap();
        assert_eq!(back.latest().map(|p| p.phase), Some(3));
        assert_eq!(back.high_water(), 4);
        assert!(back.get(2).is_some());
    }

    #[test]
    fn manifest_size_stays_bounded() {
        let tmp = tempdir().unwrap();
        let mut m = Manifest::default();
        for p in 1..=50 {
            m.add_phase(rec(p), 2);
        }
        m.save_atomic(tmp.path(), "index.manifest.json").unwrap();
        let text = std::fs::read_to_string(tmp.path().join("index.manifest.json")).unwrap();
        assert_eq!(text.matches(".qseg").count(), 2);
        assert_eq!(m.high_water(), 50);
    }

    #[test]
    fn aliased_segments_survive_retention() {
        let mut m = Manifest::default();
        m.add_phase(rec(1), 2);
        let mut alias = rec(2);
        alias.path = rec(1).path;
        m.add_phase(alias, 2);
        assert!(m.add_phase(rec(3), 2).is_empty());
        assert_eq!(m.add_phase(rec(4), 2), vec![PathBuf::from("quads-00000001.qseg")]);
    }
}
