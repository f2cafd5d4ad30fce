//! The kAFS control interface under `/proc/fs/afs`.

use crate::cells::CellRecord;
use crate::constants::{PATH_KAFS_MODULE, PATH_PROC_CELLS, PATH_PROC_ROOT_CELL};
use crate::error::KafsError;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, instrument};

#[derive(Debug, Clone)]
pub struct AfsProc {
    module: PathBuf,
    cells: PathBuf,
    root_cell: PathBuf,
}

impl Default for AfsProc {
    fn default() -> Self {
        AfsProc {
            module: PathBuf::from(PATH_KAFS_MODULE),
            cells: PathBuf::from(PATH_PROC_CELLS),
            root_cell: PathBuf::from(PATH_PROC_ROOT_CELL),
        }
    }
}

impl AfsProc {
    pub fn new(module: &Path, cells: &Path, root_cell: &Path) -> Self {
        AfsProc {
            module: module.to_path_buf(),
            cells: cells.to_path_buf(),
            root_cell: root_cell.to_path_buf(),
        }
    }

    /// kAFS is usable once its module state file can be opened. The contents are
    /// not looked at.
    pub fn has_afs_support(&self) -> bool {
        let present = File::open(&self.module).is_ok();
        debug!(?present, module = ?self.module, "kAFS presence");
        present
    }

    /// Tell the kernel about each cell and its volume location servers. Every cell
    /// is attempted even after a failure.
    #[instrument(level = "debug", skip_all)]
    pub fn populate_cell_database(&self, cells: &[CellRecord]) -> Result<(), KafsError> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.cells)
            .map_err(|io_err| {
                error!(?io_err, "Unable to open {:?}", self.cells);
                KafsError::CellDatabaseWrite
            })?;
        add_cells(&mut f, cells)
    }

    /// Set the cell mounted at the AFS root. The cell must already be known to the
    /// kernel.
    pub fn set_root_cell(&self, cell: &str) -> Result<(), KafsError> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(&self.root_cell)
            .map_err(|io_err| {
                error!(?io_err, "Unable to open {:?}", self.root_cell);
                KafsError::RootCellWrite
            })?;
        f.write_all(format!("{cell}\n").as_bytes()).map_err(|io_err| {
            error!(?io_err, %cell, "Unable to set root cell");
            KafsError::RootCellWrite
        })
    }
}

fn add_cells<W: Write>(w: &mut W, cells: &[CellRecord]) -> Result<(), KafsError> {
    let mut failed = 0usize;
    for cell in cells {
        // The kernel parses one command per write.
        let line = format!("add {} {}\n", cell.name, cell.vls.join(":"));
        match w.write_all(line.as_bytes()) {
            Ok(()) => debug!(cell = %cell.name, "added cell"),
            Err(io_err) => {
                error!(?io_err, cell = %cell.name, "Unable to add cell");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        Ok(())
    } else {
        Err(KafsError::CellDatabaseWrite)
    }
}
