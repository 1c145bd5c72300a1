//! Calibration parameter list of a connection
//!
//! Parameters are resolved against the `p%i` records once, when a calibration session
//! starts. Afterwards the list is polled from two cursors: one walks the list once to
//! upload every parameter from the target, the other keeps looking for parameters the
//! application has written and hands them out for download.

use crate::{
    codec::{ByteOrder, ScalarType, ScalarValue},
    config::ConnectionConfig,
    variables::{VariableId, VariableStore},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Fatal calibration list errors
pub enum CalibrationError {
    /// The list could not be allocated
    #[error("out of memory")]
    OutOfMemory,
}

/// A resolved parameter
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationItem {
    /// Requested name
    pub name: String,
    /// Target address including the parameter offset. 0 if unresolved
    pub address: u32,
    /// Type of the parameter
    pub kind: Option<ScalarType>,
    /// Local variable. `None` if the parameter could not be resolved
    pub variable: Option<VariableId>,
}

impl CalibrationItem {
    fn valid(&self) -> Option<(VariableId, ScalarType)> {
        Some((self.variable?, self.kind?))
    }
}

/// Single parameter transfer handed to the session
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTransfer {
    /// Index of the parameter in the list
    pub index: usize,
    /// Target address
    pub address: u32,
    /// Parameter type
    pub kind: ScalarType,
    /// Encoded value for downloads, empty for uploads
    pub bytes: Vec<u8>,
}

impl ParameterTransfer {
    /// Bytes to transfer
    pub fn size(&self) -> usize {
        self.kind.size()
    }
}

/// Result of [CalibrationList::poll_read_next]
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState {
    /// Upload this parameter next
    Upload(ParameterTransfer),
    /// The entry under the cursor is not valid, nothing to do this time
    Skip,
    /// The whole list has been walked, the cursor starts over
    Done,
}

/// Calibration parameters of one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationList {
    items: Vec<CalibrationItem>,
    write_pos: usize,
    read_pos: usize,
}

impl CalibrationList {
    /// Resolves `names` against the parameter records of `config`.
    ///
    /// Unknown names stay in the list as invalid entries so indexes match the request.
    pub fn build(
        names: &[String],
        config: &ConnectionConfig,
        store: &mut dyn VariableStore,
    ) -> Result<Self, CalibrationError> {
        let proto = config.protocol;
        let mut items = Vec::new();
        items
            .try_reserve_exact(names.len())
            .map_err(|_| CalibrationError::OutOfMemory)?;
        for name in names {
            let mut item = CalibrationItem {
                name: name.clone(),
                address: 0,
                kind: None,
                variable: None,
            };
            match config.parameter(name) {
                Some(rec) if rec.kind.is_some() => {
                    item.address = config.param_offset.wrapping_add(rec.address);
                    item.kind = rec.kind;
                    item.variable = rec
                        .kind
                        .and_then(|kind| store.attach(name, kind, &rec.meta(config.meta)));
                    if item.variable.is_none() {
                        log::error!("{proto}: cannot add calibration parameter \"{name}\" to the variable store");
                    }
                }
                _ => {
                    log::error!("{proto}: parameter \"{name}\" is not configured and cannot calibrate");
                }
            }
            items.push(item);
        }
        Ok(Self {
            items,
            write_pos: 0,
            read_pos: 0,
        })
    }

    /// Releases every valid local variable and empties the list
    pub fn delete(&mut self, store: &mut dyn VariableStore) {
        for item in self.items.drain(..) {
            if let Some(id) = item.variable {
                store.release(id);
            }
        }
        self.write_pos = 0;
        self.read_pos = 0;
    }

    /// Parameters in request order
    pub fn items(&self) -> &[CalibrationItem] {
        &self.items
    }

    /// Number of entries, valid or not
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if the list has no entries
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Finds the next parameter the application has written since it was last checked.
    ///
    /// The search starts at the last serviced entry and wraps around once. The written
    /// flag of the returned parameter is consumed.
    pub fn poll_write(&mut self, store: &mut dyn VariableStore, order: ByteOrder) -> Option<ParameterTransfer> {
        let len = self.items.len();
        if len == 0 {
            return None;
        }
        let start = self.write_pos % len;
        let mut pos = start;
        loop {
            let item = &self.items[pos];
            if let Some((id, kind)) = item.valid() {
                if store.take_written(id) {
                    self.write_pos = pos;
                    let value = store.read(id)?;
                    return Some(ParameterTransfer {
                        index: pos,
                        address: item.address,
                        kind,
                        bytes: ScalarValue::from_f64(kind, value).encode(order),
                    });
                }
            }
            pos = (pos + 1) % len;
            if pos == start {
                self.write_pos = pos;
                return None;
            }
        }
    }

    /// Advances the upload cursor by one entry
    pub fn poll_read_next(&mut self) -> ReadState {
        if self.read_pos >= self.items.len() {
            self.read_pos = 0;
            return ReadState::Done;
        }
        let index = self.read_pos;
        self.read_pos += 1;
        let item = &self.items[index];
        match item.valid() {
            Some((_, kind)) => ReadState::Upload(ParameterTransfer {
                index,
                address: item.address,
                kind,
                bytes: Vec::new(),
            }),
            None => ReadState::Skip,
        }
    }

    /// Builds a readback of parameter `index`
    pub fn readback(&self, index: usize) -> Option<ParameterTransfer> {
        let item = self.items.get(index)?;
        let (_, kind) = item.valid()?;
        Some(ParameterTransfer {
            index,
            address: item.address,
            kind,
            bytes: Vec::new(),
        })
    }

    /// Stores uploaded bytes of parameter `index` in its local variable. The resulting
    /// store write does not count as an application write, so no download follows
    pub fn apply_upload(&self, index: usize, bytes: &[u8], order: ByteOrder, store: &mut dyn VariableStore) {
        let Some((id, kind)) = self.items.get(index).and_then(CalibrationItem::valid) else {
            return;
        };
        match ScalarValue::decode(kind, bytes, order) {
            Some(v) => {
                store.write(id, v.as_f64());
                store.take_written(id);
            }
            None => log::warn!("Short upload of {} bytes for a {kind} parameter", bytes.len()),
        }
    }
}
