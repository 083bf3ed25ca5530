#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory parcel index and the point-to-parcel spatial join.
//!
//! Parcels are loaded from a `DuckDB` table (attributes as JSON, boundary
//! as `GeoJSON`) into an R-tree keyed on each parcel's bounding box. The
//! index answers "which parcels does this point intersect", in the order
//! the parcels were loaded, which keeps the join deterministic.

use std::collections::BTreeSet;

use damage_assessment_report_models::{
    Attributes, DamageReport, JoinResult, Parcel, ReportPoint, ResolutionTag, is_sql_identifier,
};
use geo::{Intersects, MultiPolygon};
use geojson::GeoJson;
use rstar::{AABB, RTree, RTreeObject};

/// Errors that can occur while loading parcels.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// `DuckDB` query failed.
    #[error("Database error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// Attribute JSON could not be parsed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A parcel boundary is not a polygon or multipolygon.
    #[error("Invalid geometry for parcel {apn}: {message}")]
    Geometry {
        /// APN of the offending parcel, or its row position.
        apn: String,
        /// What was wrong.
        message: String,
    },

    /// The table name is not a plain identifier.
    #[error("Invalid table name: {0}")]
    InvalidName(String),
}

/// A parcel stored in the R-tree with its load position.
struct ParcelEntry {
    position: usize,
    envelope: AABB<[f64; 2]>,
    parcel: Parcel,
}

impl RTreeObject for ParcelEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree over reference parcels.
pub struct ParcelIndex {
    tree: RTree<ParcelEntry>,
}

impl ParcelIndex {
    /// Builds an index. Parcel order is preserved for lookups.
    #[must_use]
    pub fn new(parcels: Vec<Parcel>) -> Self {
        let entries = parcels
            .into_iter()
            .enumerate()
            .map(|(position, parcel)| ParcelEntry {
                position,
                envelope: compute_envelope(&parcel.boundary),
                parcel,
            })
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Loads every parcel of `table` and indexes it.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the query fails or a row holds invalid
    /// attributes or geometry.
    pub fn load(conn: &duckdb::Connection, table: &str) -> Result<Self, SpatialError> {
        let parcels = load_parcels(conn, table)?;
        log::info!("Loaded {} parcels from {table} into spatial index", parcels.len());
        Ok(Self::new(parcels))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    fn entries_at(&self, point: ReportPoint) -> Vec<&ParcelEntry> {
        let p = geo::Point::new(point.x, point.y);
        let query_env = AABB::from_point([point.x, point.y]);

        let mut hits: Vec<&ParcelEntry> = self
            .tree
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.parcel.boundary.intersects(&p))
            .collect();
        hits.sort_by_key(|entry| entry.position);
        hits
    }

    /// Parcels intersecting `point`, in load order. A point on a shared
    /// boundary intersects both parcels.
    #[must_use]
    pub fn intersecting(&self, point: ReportPoint) -> Vec<&Parcel> {
        self.entries_at(point)
            .into_iter()
            .map(|entry| &entry.parcel)
            .collect()
    }

    /// Returns `true` if `point` intersects at least one parcel.
    #[must_use]
    pub fn intersects_any(&self, point: ReportPoint) -> bool {
        let p = geo::Point::new(point.x, point.y);
        self.tree
            .locate_in_envelope_intersecting(&AABB::from_point([point.x, point.y]))
            .any(|entry| entry.parcel.boundary.intersects(&p))
    }

    /// Builds a smaller index holding only the parcels that intersect at
    /// least one report location.
    #[must_use]
    pub fn extract_intersecting(&self, reports: &[DamageReport]) -> Self {
        let positions: BTreeSet<usize> = reports
            .iter()
            .filter_map(|r| r.geometry)
            .flat_map(|point| self.entries_at(point).into_iter().map(|e| e.position))
            .collect();

        let mut selected: Vec<&ParcelEntry> = self
            .tree
            .iter()
            .filter(|entry| positions.contains(&entry.position))
            .collect();
        selected.sort_by_key(|entry| entry.position);

        Self::new(selected.into_iter().map(|e| e.parcel.clone()).collect())
    }
}

/// One-to-many join of reports against parcels.
///
/// Each report yields one row per intersecting parcel, in parcel load
/// order. A report with no geometry or no intersecting parcel yields a
/// single row without parcel attribution. Rows are numbered in output
/// order and tagged [`ResolutionTag::Unresolved`].
#[must_use]
pub fn spatial_join(reports: &[DamageReport], index: &ParcelIndex) -> Vec<JoinResult> {
    let mut rows = Vec::with_capacity(reports.len());
    for report in reports {
        let parcels = report
            .geometry
            .map(|point| index.intersecting(point))
            .unwrap_or_default();

        if parcels.is_empty() {
            rows.push(JoinResult {
                report: report.clone(),
                parcel: None,
                join_order: rows.len(),
                tag: ResolutionTag::Unresolved,
            });
            continue;
        }

        for parcel in parcels {
            rows.push(JoinResult {
                report: report.clone(),
                parcel: Some(parcel.attributes.clone()),
                join_order: rows.len(),
                tag: ResolutionTag::Unresolved,
            });
        }
    }
    rows
}

/// Reads `(attributes_json, boundary_geojson)` rows from `table`.
///
/// # Errors
///
/// Returns [`SpatialError`] if the table name is invalid, the query fails,
/// or a row cannot be decoded.
pub fn load_parcels(conn: &duckdb::Connection, table: &str) -> Result<Vec<Parcel>, SpatialError> {
    if !is_sql_identifier(table) {
        return Err(SpatialError::InvalidName(table.to_string()));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT attributes_json, boundary_geojson FROM {table} \
         WHERE boundary_geojson IS NOT NULL ORDER BY rowid"
    ))?;
    let mut rows = stmt.query([])?;
    let mut parcels = Vec::new();

    while let Some(row) = rows.next()? {
        let attributes_json: String = row.get(0)?;
        let geojson_str: String = row.get(1)?;

        let attributes: Attributes = serde_json::from_str(&attributes_json)?;
        let parcel_label = attributes
            .get(damage_assessment_report_models::APN_FIELD)
            .and_then(damage_assessment_report_models::attribute_text)
            .unwrap_or_else(|| format!("row {}", parcels.len()));

        let boundary =
            parse_geojson_to_multipolygon(&geojson_str).ok_or_else(|| SpatialError::Geometry {
                apn: parcel_label,
                message: "boundary is not a Polygon or MultiPolygon".to_string(),
            })?;

        parcels.push(Parcel {
            attributes,
            boundary,
        });
    }

    Ok(parcels)
}

/// Creates `table` if needed and appends `parcels` to it.
///
/// # Errors
///
/// Returns [`SpatialError`] if the table name is invalid or a statement
/// fails.
pub fn write_parcels(
    conn: &duckdb::Connection,
    table: &str,
    parcels: &[Parcel],
) -> Result<(), SpatialError> {
    if !is_sql_identifier(table) {
        return Err(SpatialError::InvalidName(table.to_string()));
    }

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            apn VARCHAR,
            attributes_json VARCHAR NOT NULL,
            boundary_geojson VARCHAR
        );"
    ))?;

    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {table} (apn, attributes_json, boundary_geojson) VALUES (?, ?, ?)"
    ))?;
    for parcel in parcels {
        let geometry = geojson::Geometry::new(geojson::Value::from(&parcel.boundary));
        stmt.execute(duckdb::params![
            parcel.apn(),
            serde_json::to_string(&parcel.attributes)?,
            geometry.to_string(),
        ])?;
    }
    Ok(())
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    let geometry = match geojson {
        GeoJson::Geometry(geom) => geom,
        GeoJson::Feature(feature) => feature.geometry?,
        GeoJson::FeatureCollection(_) => return None,
    };
    match geo::Geometry::<f64>::try_from(geometry).ok()? {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    use geo::BoundingRect;

    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}
