//! Tile request parsing and response header policy.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::PlateError;

// =============================================================================
// Configuration
// =============================================================================

/// Deepest level still considered "low zoom" for caching purposes.
pub const LONG_CACHE_MAX_LEVEL: u32 = 7;

/// Cache lifetime for tiles at or above [`LONG_CACHE_MAX_LEVEL`] (one week).
pub const LONG_CACHE_MAX_AGE: u32 = 604_800;

/// Cache lifetime for deeper tiles (twenty minutes).
pub const SHORT_CACHE_MAX_AGE: u32 = 1_200;

// =============================================================================
// Tile path
// =============================================================================

/// Coordinates parsed from `/<store_id>/<level>/<col>/<row>.<format>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePath {
    pub store_id: u32,
    pub level: u32,
    pub col: u32,
    pub row: u32,
    pub format: String,
}

fn tile_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(\d+)/(\d+)/(\d+)/(\d+)\.(\w+)$").expect("valid regex"))
}

impl TilePath {
    /// Parse a path relative to the mount point.
    ///
    /// `Ok(None)` means the path is not a tile path at all and another handler
    /// should try it. Numbers too large for a `u32` are a bad request.
    pub fn parse(path: &str) -> Result<Option<Self>, PlateError> {
        let Some(caps) = tile_path_regex().captures(path) else {
            return Ok(None);
        };

        let number = |i: usize, what: &str| -> Result<u32, PlateError> {
            caps[i]
                .parse()
                .map_err(|_| PlateError::BadRequest(format!("{what} out of range: {}", &caps[i])))
        };

        Ok(Some(TilePath {
            store_id: number(1, "store id")?,
            level: number(2, "level")?,
            col: number(3, "column")?,
            row: number(4, "row")?,
            format: caps[5].to_string(),
        }))
    }
}

// =============================================================================
// Query parameters
// =============================================================================

/// Which transaction a tile read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSelector {
    /// The store's latest cursor, read when the request is served
    Current,
    /// A specific transaction; with `exact`, no fallback to earlier ones
    At { id: u64, exact: bool },
}

/// Query parameters of a tile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileQuery {
    pub transaction: TransactionSelector,
    pub nocache: bool,
}

impl Default for TileQuery {
    fn default() -> Self {
        Self {
            transaction: TransactionSelector::Current,
            nocache: false,
        }
    }
}

impl TileQuery {
    /// Build from decoded query parameters.
    ///
    /// `transaction_id` absent or `-1` selects the current cursor and ignores
    /// `exact`. Any other negative id is a bad request.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, PlateError> {
        let transaction_id = match params.get("transaction_id") {
            None => -1,
            Some(raw) => raw.trim().parse::<i64>().map_err(|_| {
                PlateError::BadRequest(format!("transaction_id is not an integer: {raw}"))
            })?,
        };
        let exact = parse_bool(params, "exact")?;
        let nocache = parse_bool(params, "nocache")?;

        let transaction = match transaction_id {
            -1 => TransactionSelector::Current,
            id if id < -1 => {
                return Err(PlateError::BadRequest(format!(
                    "transaction_id must be -1 or non-negative, got {id}"
                )))
            }
            id => TransactionSelector::At {
                id: id as u64,
                exact,
            },
        };

        Ok(Self {
            transaction,
            nocache,
        })
    }
}

fn parse_bool(params: &HashMap<String, String>, key: &str) -> Result<bool, PlateError> {
    match params.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "1" || v == "true" => Ok(true),
        Some(v) if v == "0" || v == "false" => Ok(false),
        Some(v) => Err(PlateError::BadRequest(format!("{key} is not a boolean: {v}"))),
    }
}

// =============================================================================
// Response headers
// =============================================================================

/// `Cache-Control` value for a tile at `level`.
pub fn cache_control(level: u32, nocache: bool) -> String {
    if nocache {
        "no-cache".to_string()
    } else if level <= LONG_CACHE_MAX_LEVEL {
        format!("max-age={LONG_CACHE_MAX_AGE}")
    } else {
        format!("max-age={SHORT_CACHE_MAX_AGE}")
    }
}

/// `Content-Type` for a tile file format.
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}
