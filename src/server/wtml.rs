//! WTML listing of the cached stores.
//!
//! A WTML document is a `<Folder>` of `<ImageSet>` elements, one per store,
//! each pointing a viewer at the tile URL template of that store.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use http::header::HOST;
use http::HeaderMap;
use regex::Regex;

use crate::cache::IndexCacheEntry;

/// Content type of a WTML listing.
pub const WTML_CONTENT_TYPE: &str = "application/xml";

/// `DemUrl` used when none is configured.
pub const DEFAULT_DEM_URL: &str = "http://198.10.124.49/static/megt128/{0}/{1}/{2}?nocache=1";

const FOLDER_OPEN: &str = "<Folder Name='Ames Planetary Content' Group='View'>";

fn wtml_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/(\w+\.wtml)$").expect("valid regex"))
}

/// File name of a listing path such as `/moon.wtml`, or `None` if `path` is
/// not a listing path.
pub fn parse_wtml_path(path: &str) -> Option<&str> {
    wtml_path_regex()
        .captures(path)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// `scheme://host[:port]<base_path>` as seen by the client.
///
/// The scheme comes from `X-Forwarded-Proto` when a proxy sets it. A missing
/// `Host` header falls back to `localhost`.
pub fn request_prefix(headers: &HeaderMap, base_path: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
        .unwrap_or("http");
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    format!("{scheme}://{host}{}", base_path.trim_end_matches('/'))
}

/// Escape a string for use inside a single-quoted XML attribute or text node.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// One `<ImageSet>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSet {
    /// Attributes, emitted in key order
    pub attributes: BTreeMap<&'static str, String>,
    pub thumbnail_url: String,
    pub credits: String,
}

impl ImageSet {
    /// Build the image set for one store.
    ///
    /// `prefix` is the result of [`request_prefix`]; `query` is the raw query
    /// string of the listing request, appended to both URLs when present.
    pub fn for_entry<S>(
        entry: &IndexCacheEntry<S>,
        prefix: &str,
        query: Option<&str>,
        dem_url: &str,
    ) -> Self {
        let mut attributes = BTreeMap::new();
        for (key, value) in [
            ("Generic", "False"),
            ("DataSetType", "Planet"),
            ("BandPass", "Visible"),
            ("BaseTileLevel", "0"),
            ("BaseDegreesPerTile", "360"),
            ("BottomsUp", "False"),
            ("Projection", "Toast"),
            ("QuadTreeMap", "0123"),
            ("CenterX", "0"),
            ("CenterY", "0"),
            ("OffsetX", "0"),
            ("OffsetY", "0"),
            ("Rotation", "0"),
            ("Sparse", "True"),
            ("ElevationModel", "False"),
            ("StockSet", "False"),
        ] {
            attributes.insert(key, value.to_string());
        }
        attributes.insert("DemUrl", dem_url.to_string());
        attributes.insert("Name", entry.description.clone());
        attributes.insert("FileType", format!(".{}", entry.tile_filetype));
        attributes.insert("TileLevels", entry.num_levels.to_string());

        let base = format!("{prefix}/p/{}", entry.store_id);
        let suffix = query
            .filter(|q| !q.is_empty())
            .map(|q| format!("?{q}"))
            .unwrap_or_default();

        attributes.insert(
            "Url",
            format!("{base}/{{1}}/{{2}}/{{3}}.{}{suffix}", entry.tile_filetype),
        );

        Self {
            attributes,
            thumbnail_url: format!("{base}/0/0/0.{}{suffix}", entry.tile_filetype),
            credits: String::new(),
        }
    }

    fn write_to(&self, out: &mut String) {
        out.push_str("<ImageSet");
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&xml_escape(value));
            out.push('\'');
        }
        out.push_str(">\n");
        out.push_str(&format!(
            "\t<Credits>{}</Credits>\n",
            xml_escape(&self.credits)
        ));
        out.push_str(&format!(
            "\t<ThumbnailUrl>{}</ThumbnailUrl>\n",
            xml_escape(&self.thumbnail_url)
        ));
        out.push_str("</ImageSet>\n");
    }
}

/// Render the listing document for `entries`.
pub fn render_wtml<S>(
    entries: &[std::sync::Arc<IndexCacheEntry<S>>],
    prefix: &str,
    query: Option<&str>,
    dem_url: &str,
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='UTF-8'?>\n");
    out.push_str(FOLDER_OPEN);
    out.push_str("\n\n");
    for entry in entries {
        ImageSet::for_entry(entry, prefix, query, dem_url).write_to(&mut out);
    }
    out.push_str("</Folder>\n");
    out
}
