use rusqlite::Connection;
use std::collections::HashSet;

/// Base tables. Parcel identity rows are pre-loaded by an external ingest;
/// the engine only adds pass columns. Both creates are no-ops on a live
/// database.
const BASE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS parcels_core (
        county          TEXT NOT NULL,
        state_code      TEXT NOT NULL,
        parcel_id       TEXT NOT NULL,
        latitude        REAL,
        longitude       REAL,
        situs_address   TEXT,
        mailing_city    TEXT,
        mailing_state   TEXT,
        mailing_zip     TEXT,
        property_class  TEXT,
        total_value     REAL,
        sqft            REAL,
        PRIMARY KEY (county, parcel_id)
    )",
    "CREATE TABLE IF NOT EXISTS motivation_signals (
        parcel_ref  TEXT NOT NULL,
        weight      REAL NOT NULL,
        confidence  REAL NOT NULL,
        code        TEXT NOT NULL,
        active      INTEGER NOT NULL DEFAULT 1,
        expires_at  TEXT
    )",
];

/// Pass-owned columns, grouped the way the passes own them. Added only when
/// missing (schema metadata is consulted first, so a fully migrated store
/// takes no ALTER locks).
const PASS_COLUMNS: &[(&str, &str)] = &[
    // ── Pass 1: aerial + flood ──
    ("ndvi_current", "REAL"),
    ("ndvi_date", "TEXT"),
    ("ndvi_category", "TEXT"),
    ("fema_zone", "TEXT"),
    ("fema_risk", "TEXT"),
    ("fema_sfha", "INTEGER DEFAULT 0"),
    ("distress_score", "REAL"),
    ("distress_flags", "TEXT"),
    ("flag_veg_overgrowth", "INTEGER DEFAULT 0"),
    ("flag_veg_neglect", "INTEGER DEFAULT 0"),
    ("flag_flood", "INTEGER DEFAULT 0"),
    ("flag_structural", "INTEGER DEFAULT 0"),
    ("veg_confidence", "REAL"),
    ("flood_confidence", "REAL"),
    ("scan_date", "TEXT"),
    ("scan_pass", "REAL"),
    ("sentinel_worthy", "INTEGER DEFAULT 0"),
    // ── Pass 1.5: historical slope + composite ──
    ("ndvi_slope_per_year", "REAL"),
    ("ndvi_slope_pctile", "REAL"),
    ("ndvi_history_count", "INTEGER"),
    ("ndvi_history_years", "TEXT"),
    ("distress_composite", "REAL"),
    ("composite_date", "TEXT"),
    // ── Pass 1.75: trend enrichment ──
    ("sentinel_trend_direction", "TEXT"),
    ("sentinel_trend_slope", "REAL"),
    ("sentinel_latest_ndvi", "REAL"),
    ("sentinel_months_data", "INTEGER"),
    ("sentinel_mean_ndvi", "REAL"),
    ("sentinel_data_source", "TEXT"),
    ("sentinel_chart_url", "TEXT"),
    ("sentinel_scan_date", "TEXT"),
    // ── Pass 2: scene comparison ──
    ("planet_scene_count", "INTEGER"),
    ("planet_change_score", "REAL"),
    ("planet_temporal_span_days", "INTEGER"),
    ("planet_latest_date", "TEXT"),
    ("planet_earliest_date", "TEXT"),
    ("planet_thumb_latest_url", "TEXT"),
    ("planet_thumb_earliest_url", "TEXT"),
    ("planet_scan_date", "TEXT"),
    // ── Pass 2.25: carrier vacancy ──
    ("usps_vacant", "INTEGER"),
    ("usps_dpv_confirmed", "INTEGER"),
    ("usps_address", "TEXT"),
    ("usps_city", "TEXT"),
    ("usps_zip", "TEXT"),
    ("usps_zip4", "TEXT"),
    ("usps_business", "INTEGER"),
    ("usps_carrier_route", "TEXT"),
    ("usps_address_mismatch", "INTEGER"),
    ("usps_check_date", "TEXT"),
    ("usps_error", "TEXT"),
    ("flag_vacancy", "INTEGER DEFAULT 0"),
    ("vacancy_confidence", "REAL"),
    // ── Pass 2.5: conviction fusion ──
    ("conviction_score", "REAL"),
    ("conviction_base_score", "REAL"),
    ("conviction_vacancy_bonus", "REAL"),
    ("conviction_mc_score", "REAL"),
    ("conviction_mc_signals", "INTEGER"),
    ("conviction_mc_codes", "TEXT"),
    ("conviction_components", "TEXT"),
    ("conviction_date", "TEXT"),
];

/// Every index is IF NOT EXISTS. The two partial indexes back the slope and
/// trend eligibility predicates so pass re-runs stay cheap on large counties.
const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_pc_scan_date ON parcels_core (scan_date)",
    "CREATE INDEX IF NOT EXISTS idx_pc_distress_score ON parcels_core (distress_score)",
    "CREATE INDEX IF NOT EXISTS idx_pc_distress_composite ON parcels_core (distress_composite)",
    "CREATE INDEX IF NOT EXISTS idx_pc_fema_zone ON parcels_core (fema_zone)",
    "CREATE INDEX IF NOT EXISTS idx_pc_usps_check_date ON parcels_core (usps_check_date)",
    "CREATE INDEX IF NOT EXISTS idx_pc_conviction_score ON parcels_core (conviction_score DESC)",
    "CREATE INDEX IF NOT EXISTS idx_pc_slope_pending ON parcels_core (parcel_id)
     WHERE ndvi_current IS NOT NULL AND ndvi_slope_per_year IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_pc_sentinel_pending ON parcels_core (distress_score DESC)
     WHERE sentinel_worthy = 1 AND sentinel_scan_date IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_ms_parcel_ref ON motivation_signals (parcel_ref)",
];

/// Idempotent migration. Returns the number of columns actually added.
pub fn run(conn: &Connection) -> anyhow::Result<usize> {
    for ddl in BASE_TABLES {
        conn.execute_batch(ddl)?;
    }

    let existing = existing_columns(conn, "parcels_core")?;
    let missing: Vec<&(&str, &str)> = PASS_COLUMNS
        .iter()
        .filter(|(name, _)| !existing.contains(*name))
        .collect();

    for (name, col_type) in &missing {
        conn.execute_batch(&format!(
            "ALTER TABLE parcels_core ADD COLUMN {name} {col_type}"
        ))?;
    }

    for ddl in INDEXES {
        conn.execute_batch(ddl)?;
    }

    if missing.is_empty() {
        tracing::debug!("migration: schema current, nothing to add");
    } else {
        tracing::info!(columns_added = missing.len(), "migration complete");
    }
    Ok(missing.len())
}

fn existing_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let added_first = run(&conn).unwrap();
        assert_eq!(added_first, PASS_COLUMNS.len());
        // Second run must see schema metadata and add nothing.
        let added_second = run(&conn).unwrap();
        assert_eq!(added_second, 0);
    }

    #[test]
    fn test_migration_backfills_partial_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(BASE_TABLES[0]).unwrap();
        conn.execute_batch("ALTER TABLE parcels_core ADD COLUMN ndvi_current REAL")
            .unwrap();
        let added = run(&conn).unwrap();
        assert_eq!(added, PASS_COLUMNS.len() - 1);
    }

    #[test]
    fn test_partial_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'
                 AND name IN ('idx_pc_slope_pending', 'idx_pc_sentinel_pending')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }
}
