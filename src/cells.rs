//! Local cell configuration and cell to realm resolution.

use crate::ccache::Krb5Context;
use crate::constants::{FILE_CELL_SERV_DB, FILE_THESE_CELLS, FILE_THIS_CELL, PATH_KAFS_USER_ETC};
use crate::error::KafsError;

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, trace};

/// A cell and the addresses of its volume location servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRecord {
    pub name: String,
    pub vls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CellConfig {
    dir: PathBuf,
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            dir: PathBuf::from(PATH_KAFS_USER_ETC),
        }
    }
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
        ),
        Err(io_err) => {
            trace!(?io_err, ?path, "Unable to read cell file");
            None
        }
    }
}

impl CellConfig {
    pub fn new(dir: &Path) -> Self {
        CellConfig {
            dir: dir.to_path_buf(),
        }
    }

    /// The local cell, the first line of `ThisCell`.
    pub fn this_cell(&self) -> Option<String> {
        read_lines(&self.dir.join(FILE_THIS_CELL)).and_then(|lines| lines.into_iter().next())
    }

    pub fn these_cells(&self) -> Option<Vec<String>> {
        read_lines(&self.dir.join(FILE_THESE_CELLS))
    }

    /// `TheseCells` followed by `ThisCell`, each cell once, in the order first seen.
    /// A missing file contributes nothing.
    pub fn default_cell_set(&self) -> Result<Vec<String>, KafsError> {
        let mut cells: Vec<String> = Vec::new();

        let candidates = self
            .these_cells()
            .unwrap_or_default()
            .into_iter()
            .chain(self.this_cell());

        for cell in candidates {
            if !cells.contains(&cell) {
                cells.push(cell);
            }
        }

        if cells.is_empty() {
            debug!(dir = ?self.dir, "no cells configured");
            return Err(KafsError::NoCells);
        }
        Ok(cells)
    }

    /// Every cell described in `CellServDB`.
    pub fn cell_servers(&self) -> Result<Vec<CellRecord>, KafsError> {
        let path = self.dir.join(FILE_CELL_SERV_DB);
        let text = fs::read_to_string(&path).map_err(|io_err| {
            error!(?io_err, ?path, "Unable to read cell database");
            KafsError::IoError
        })?;
        Ok(parse_cell_serv_db(&text))
    }

    pub fn vls_for_cell(&self, cell: &str) -> Result<Option<Vec<String>>, KafsError> {
        Ok(self
            .cell_servers()?
            .into_iter()
            .find(|record| record.name == cell)
            .map(|record| record.vls))
    }
}

/// Parse the AFS `CellServDB` format:
///
/// ```text
/// >example.com      #Example Organisation
/// 192.0.2.1         #vl1.example.com
/// ```
pub fn parse_cell_serv_db(text: &str) -> Vec<CellRecord> {
    let mut records: Vec<CellRecord> = Vec::new();

    for line in text.lines() {
        if let Some(header) = line.strip_prefix('>') {
            // A nameless header still ends the previous cell's server list.
            let name = header.split_whitespace().next().unwrap_or_default();
            records.push(CellRecord {
                name: name.to_string(),
                vls: Vec::new(),
            });
        } else if line.starts_with(|c: char| c.is_ascii_digit()) {
            if let (Some(record), Some(addr)) = (records.last_mut(), line.split_whitespace().next())
            {
                record.vls.push(addr.to_string());
            }
        }
    }

    records.retain(|record| !record.name.is_empty());
    records
}

/// The Kerberos realm that issues tickets for `cell`.
pub fn resolve_realm_for_cell<C: Krb5Context + ?Sized>(
    ctx: &C,
    cell: &str,
) -> Result<String, KafsError> {
    let realm = ctx.host_realm(cell).inspect_err(|err| {
        error!(?err, %cell, "No realm for cell");
    })?;
    debug!(%cell, %realm, "resolved realm");
    Ok(realm)
}
