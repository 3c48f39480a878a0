// SPDX-License-Identifier: Apache-2.0

//! Loading trusted application images from the store.

use crate::TeeError;

use std::fs::File;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use teeport::TaUuid;
use tracing::{debug, error};

/// What one load request produced.
pub enum Loaded {
    /// The supplied buffer was too small; the required size is reported
    /// back so the secure side can retry. Not an error — this is how it
    /// discovers the image size.
    Required(u64),
    /// The image was read into the supplied buffer in full.
    Image(u64),
}

/// Resolves trusted application identities to image files in a
/// well-known store directory.
pub struct TaLoader {
    store: Utf8PathBuf,
}

impl TaLoader {
    pub fn new(store: impl Into<Utf8PathBuf>) -> Self {
        Self {
            store: store.into(),
        }
    }

    pub fn store(&self) -> &Utf8Path {
        &self.store
    }

    fn path_for(&self, uuid: &TaUuid) -> Utf8PathBuf {
        self.store.join(format!("{uuid}.ta"))
    }

    /// Loads the image for `uuid` into `dest`, or reports the required
    /// size if `dest` cannot hold it.
    pub fn load(&self, uuid: &TaUuid, dest: &mut [u8]) -> Result<Loaded, TeeError> {
        let path = self.path_for(uuid);

        let mut file = File::open(&path).map_err(|err| {
            error!(%path, %err, "failed to open trusted application image");
            TeeError::Generic
        })?;

        let len = file
            .metadata()
            .map_err(|err| {
                error!(%path, %err, "failed to query trusted application image");
                TeeError::Generic
            })?
            .len();
        if u32::try_from(len).is_err() {
            error!(%path, len, "trusted application image exceeds representable size");
            return Err(TeeError::ExcessData);
        }

        if (dest.len() as u64) < len {
            debug!(%path, len, have = dest.len(), "reporting required image size");
            return Ok(Loaded::Required(len));
        }

        file.read_exact(&mut dest[..len as usize]).map_err(|err| {
            error!(%path, %err, "failed to read trusted application image");
            TeeError::Generic
        })?;

        debug!(%path, len, "trusted application image loaded");
        Ok(Loaded::Image(len))
    }
}
