//! DTO / ODT package builder
//!
//! Measurement signals are packed into packages of [DTO_PAYLOAD] bytes. Byte 0 of every
//! DTO frame carries the package identifier, so entry offsets start at 1.
//!
//! Packing runs three passes over the requested names, placing 4 byte signals first,
//! then 2 byte and finally 1 byte signals. Every pass starts again at package 0 and
//! moves forward whenever the current package has no room left, so a signal never
//! straddles two packages.

use crate::{
    codec::ScalarType,
    config::{ConnectionConfig, SignalRecord},
    variables::{VariableId, VariableStore},
};

/// Usable bytes of one DTO frame
pub const DTO_PAYLOAD: usize = 7;

/// DTO builder result
pub type DtoResult<T> = Result<T, DtoError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Fatal errors while building the package table
pub enum DtoError {
    /// The signals need more packages than the target offers
    #[error("too many variables max. dto packages {0}")]
    TooManySignals(usize),
    /// None of the requested signals could be placed
    #[error("none of the requested signals can be measured")]
    NothingToMeasure,
}

/// One signal inside a package
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DtoEntry {
    /// Offset inside the DTO frame, 1...7
    pub byte_offset: u8,
    /// Type of the signal
    pub kind: ScalarType,
    /// Size in bytes
    pub size: u8,
    /// Target address
    pub address: u32,
    /// Local mirror variable
    pub variable: VariableId,
}

/// Signals sharing one DTO frame (CCP) or one ODT (XCP)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtoPackage {
    /// Entries in placement order
    pub entries: Vec<DtoEntry>,
}

impl DtoPackage {
    /// Bytes used by the entries
    pub fn used(&self) -> usize {
        self.entries.iter().map(|e| e.size as usize).sum()
    }
}

/// Complete package table of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtoTable {
    /// Packages in PID order
    pub packages: Vec<DtoPackage>,
}

impl DtoTable {
    /// Number of packages in use
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Total number of entries over all packages
    pub fn entry_count(&self) -> usize {
        self.packages.iter().map(|p| p.entries.len()).sum()
    }

    /// True if the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Entry `idx` of package `pid`
    pub fn entry(&self, pid: usize, idx: usize) -> Option<&DtoEntry> {
        self.packages.get(pid).and_then(|p| p.entries.get(idx))
    }

    /// Releases every local mirror variable and empties the table
    pub fn release(&mut self, store: &mut dyn VariableStore) {
        for entry in self.packages.drain(..).flat_map(|p| p.entries) {
            store.release(entry.variable);
        }
    }
}

/// Packs the signals `names` into at most `max_packages` packages.
///
/// Names without a `v%i` record, records with an unknown type and 8 byte records are
/// logged and left out. Every placed signal is attached to `store`. On error nothing
/// stays attached.
pub fn build(
    names: &[String],
    config: &ConnectionConfig,
    max_packages: usize,
    store: &mut dyn VariableStore,
) -> DtoResult<DtoTable> {
    let proto = config.protocol;
    let records: Vec<Option<&SignalRecord>> = names
        .iter()
        .map(|name| {
            let rec = config.signal(name);
            if rec.is_none() {
                log::error!("{proto}: cannot find variable \"{name}\"");
            }
            rec
        })
        .collect();

    let mut table = DtoTable::default();
    let mut placed = vec![false; names.len()];
    for size in [4usize, 2, 1] {
        let mut pid = 0usize;
        for (i, rec) in records.iter().enumerate() {
            let Some(rec) = rec else { continue };
            let Some(kind) = rec.kind.filter(|k| k.size() == size) else {
                continue;
            };
            while table.packages.get(pid).map(|p| p.used()).unwrap_or(0) + size > DTO_PAYLOAD {
                pid += 1;
            }
            if pid >= max_packages {
                log::error!("{proto}: too many variables max. dto packages {max_packages}");
                table.release(store);
                return Err(DtoError::TooManySignals(max_packages));
            }
            let Some(variable) = store.attach(&rec.name, kind, &rec.meta(config.meta)) else {
                log::error!("{proto}: cannot add measurement \"{}\" to the variable store", rec.name);
                continue;
            };
            if table.packages.len() <= pid {
                table.packages.resize_with(pid + 1, DtoPackage::default);
            }
            let package = &mut table.packages[pid];
            package.entries.push(DtoEntry {
                byte_offset: (package.used() + 1) as u8,
                kind,
                size: size as u8,
                address: rec.address,
                variable,
            });
            placed[i] = true;
        }
    }

    for (name, _) in names.iter().zip(&placed).filter(|(_, p)| !**p) {
        log::error!("{proto}: unknown measurement \"{name}\"");
    }
    if table.is_empty() {
        return Err(DtoError::NothingToMeasure);
    }
    log::debug!(
        "{proto}: {} signals in {} packages",
        table.entry_count(),
        table.package_count()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{IniFile, Protocol},
        variables::MemoryStore,
    };

    fn config(lines: &[&str]) -> ConnectionConfig {
        let mut text = String::from("[CCP Configuration for Target 0]\n");
        for (i, l) in lines.iter().enumerate() {
            text.push_str(&format!("v{i}={l}\n"));
        }
        ConnectionConfig::from_ini(&IniFile::parse(&text).unwrap(), Protocol::Ccp, 0)
    }

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn packs_largest_first_without_straddling() {
        let cfg = config(&[
            "UBYTE,a,0x10",
            "UWORD,b,0x20",
            "UDWORD,c,0x30",
            "FLOAT,d,0x40",
            "UBYTE,e,0x50",
            "WORD,f,0x60",
        ]);
        let mut store = MemoryStore::new();
        let table = build(&names(&["a", "b", "c", "d", "e", "f"]), &cfg, 8, &mut store).unwrap();

        for p in &table.packages {
            assert!(p.used() <= DTO_PAYLOAD);
            let mut expected_offset = 1;
            for e in &p.entries {
                assert_eq!(e.byte_offset as usize, expected_offset);
                expected_offset += e.size as usize;
                assert!(expected_offset - 1 <= DTO_PAYLOAD);
            }
            // non increasing size inside a package
            assert!(p.entries.windows(2).all(|w| w[0].size >= w[1].size));
        }
        // c fills package 0, d opens package 1, the 2 byte pass starts over at package 0
        let sizes: Vec<Vec<u8>> = table
            .packages
            .iter()
            .map(|p| p.entries.iter().map(|e| e.size).collect())
            .collect();
        assert_eq!(sizes, vec![vec![4, 2, 1], vec![4, 2, 1]]);
        assert_eq!(table.entry(0, 0).unwrap().address, 0x30);
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn missing_and_unsupported_signals_are_skipped() {
        let cfg = config(&["UWORD,rpm,0x10", "DOUBLE,big,0x20", "LONG,odd,0x30"]);
        let mut store = MemoryStore::new();
        let table = build(&names(&["rpm", "big", "odd", "ghost"]), &cfg, 4, &mut store).unwrap();
        assert_eq!(table.entry_count(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn budget_exceeded_releases_everything() {
        let cfg = config(&["UDWORD,a,0", "UDWORD,b,4", "UDWORD,c,8"]);
        let mut store = MemoryStore::new();
        let err = build(&names(&["a", "b", "c"]), &cfg, 2, &mut store).unwrap_err();
        assert_eq!(err, DtoError::TooManySignals(2));
        assert!(store.is_empty());
    }

    #[test]
    fn nothing_placed_is_fatal() {
        let cfg = config(&["UWORD,rpm,0x10"]);
        let mut store = MemoryStore::new();
        assert_eq!(
            build(&names(&["ghost"]), &cfg, 4, &mut store),
            Err(DtoError::NothingToMeasure)
        );
    }

    #[test]
    fn release_drops_attachments_once() {
        let cfg = config(&["UWORD,rpm,0x10", "UBYTE,load,0x12"]);
        let mut store = MemoryStore::new();
        let mut table = build(&names(&["rpm", "load"]), &cfg, 4, &mut store).unwrap();
        assert_eq!(store.attach_count("rpm"), 1);
        table.release(&mut store);
        assert!(table.is_empty());
        assert!(store.is_empty());
        table.release(&mut store);
        assert!(store.is_empty());
    }
}
