pub mod migrations;

use std::path::PathBuf;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use sha2::{Digest, Sha256};

use crate::models::parcel::*;

const CHUNK_SIZE: usize = 500;

/// Parcel store over a single SQLite database.
///
/// Holds only the path: the upstream database is known to idle-kill
/// long-held connections, so every flush and selector opens a fresh
/// connection and drops it when done.
pub struct ParcelStore {
    path: PathBuf,
}

pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn cutoff_timestamp(days: i64) -> String {
    (Utc::now() - ChronoDuration::days(days))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Transient vacancy-check errors that must stay retry-eligible.
pub fn is_transient_usps_error(code: &str) -> bool {
    code == "rate_limited"
        || code == "timeout"
        || code.starts_with("http_5")
        || code.starts_with("network")
}

impl ParcelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Fresh connection with pragmas and the hash function registered.
    pub fn connect(&self) -> anyhow::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        register_parcel_hash(&conn)?;
        Ok(conn)
    }

    pub fn migrate(&self) -> anyhow::Result<usize> {
        let conn = self.connect()?;
        migrations::run(&conn)
    }

    // ── Selectors ──

    /// Pass-1 work list: coordinates present, never scanned. Ordered by a
    /// deterministic hash of parcel_id — geographic diversity without an
    /// O(N log N) sort, and a stable order across resumed runs.
    pub fn select_unscanned(
        &self,
        county: &str,
        state: Option<&str>,
        property_class: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<UnscannedParcel>> {
        let mut sql = String::from(
            "SELECT parcel_id, county, state_code, latitude, longitude
             FROM parcels_core
             WHERE county = ?1
               AND latitude IS NOT NULL AND longitude IS NOT NULL
               AND scan_date IS NULL",
        );
        let mut values: Vec<Value> = vec![Value::from(county.to_string())];
        if let Some(state) = state {
            values.push(Value::from(state.to_string()));
            sql.push_str(&format!(" AND state_code = ?{}", values.len()));
        }
        if let Some(class) = property_class {
            values.push(Value::from(class.to_string()));
            sql.push_str(&format!(" AND property_class = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY parcel_hash(parcel_id)");
        if let Some(limit) = limit {
            values.push(Value::from(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(UnscannedParcel {
                    parcel_id: row.get(0)?,
                    county: row.get(1)?,
                    state_code: row.get(2)?,
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pass-1.5 work list: has pass-1 NDVI, no slope yet.
    pub fn select_needing_slope(
        &self,
        county: &str,
        state: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<SlopeParcel>> {
        let mut sql = String::from(
            "SELECT parcel_id, county, latitude, longitude, ndvi_current, ndvi_date
             FROM parcels_core
             WHERE county = ?1
               AND ndvi_current IS NOT NULL
               AND ndvi_slope_per_year IS NULL
               AND latitude IS NOT NULL AND longitude IS NOT NULL",
        );
        let mut values: Vec<Value> = vec![Value::from(county.to_string())];
        if let Some(state) = state {
            values.push(Value::from(state.to_string()));
            sql.push_str(&format!(" AND state_code = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY parcel_hash(parcel_id)");
        if let Some(limit) = limit {
            values.push(Value::from(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(SlopeParcel {
                    parcel_id: row.get(0)?,
                    county: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    ndvi_current: row.get(4)?,
                    ndvi_date: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pass-1.75 work list: flagged worthy, not yet enriched, highest
    /// distress first.
    pub fn select_sentinel_worthy(
        &self,
        county: &str,
        state: Option<&str>,
        limit: Option<usize>,
    ) -> anyhow::Result<Vec<TrendParcel>> {
        let mut sql = String::from(
            "SELECT parcel_id, county, latitude, longitude, ndvi_current,
                    fema_zone, fema_risk, fema_sfha, distress_score
             FROM parcels_core
             WHERE county = ?1
               AND sentinel_worthy = 1
               AND sentinel_scan_date IS NULL
               AND latitude IS NOT NULL AND longitude IS NOT NULL",
        );
        let mut values: Vec<Value> = vec![Value::from(county.to_string())];
        if let Some(state) = state {
            values.push(Value::from(state.to_string()));
            sql.push_str(&format!(" AND state_code = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY distress_score IS NULL, distress_score DESC");
        if let Some(limit) = limit {
            values.push(Value::from(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(TrendParcel {
                    parcel_id: row.get(0)?,
                    county: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    ndvi_current: row.get(4)?,
                    fema_zone: row.get(5)?,
                    fema_risk: row.get(6)?,
                    fema_sfha: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
                    distress_score: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pass-2 work list: scanned parcels, gated on scene-scan recency
    /// unless forced.
    pub fn select_for_scenes(
        &self,
        county: &str,
        limit: Option<usize>,
        force: bool,
        recency_days: i64,
    ) -> anyhow::Result<Vec<SceneParcel>> {
        let mut sql = String::from(
            "SELECT parcel_id, county, latitude, longitude, planet_scan_date
             FROM parcels_core
             WHERE county = ?1
               AND scan_date IS NOT NULL
               AND latitude IS NOT NULL AND longitude IS NOT NULL",
        );
        let mut values: Vec<Value> = vec![Value::from(county.to_string())];
        if !force {
            values.push(Value::from(cutoff_timestamp(recency_days)));
            sql.push_str(&format!(
                " AND (planet_scan_date IS NULL OR planet_scan_date < ?{})",
                values.len()
            ));
        }
        sql.push_str(" ORDER BY distress_score IS NULL, distress_score DESC");
        if let Some(limit) = limit {
            values.push(Value::from(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(SceneParcel {
                    parcel_id: row.get(0)?,
                    county: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    planet_scan_date: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pass-2.25 work list: top leads by composite that were never
    /// successfully checked, are stale, or failed transiently (usps_error
    /// set with check date still NULL keeps them eligible).
    pub fn select_needing_usps(
        &self,
        county: &str,
        state: Option<&str>,
        limit: Option<usize>,
        min_composite: f64,
        cache_days: i64,
        property_class: Option<&str>,
    ) -> anyhow::Result<Vec<VacancyParcel>> {
        let mut sql = String::from(
            "SELECT parcel_id, county, state_code, latitude, longitude, situs_address,
                    distress_composite, mailing_city, mailing_state, mailing_zip
             FROM parcels_core
             WHERE county = ?1
               AND situs_address IS NOT NULL
               AND latitude IS NOT NULL AND longitude IS NOT NULL
               AND distress_composite >= ?2
               AND (usps_check_date IS NULL OR usps_check_date < ?3 OR usps_error IS NOT NULL)",
        );
        let mut values: Vec<Value> = vec![
            Value::from(county.to_string()),
            Value::from(min_composite),
            Value::from(cutoff_timestamp(cache_days)),
        ];
        if let Some(state) = state {
            values.push(Value::from(state.to_string()));
            sql.push_str(&format!(" AND state_code = ?{}", values.len()));
        }
        if let Some(class) = property_class {
            values.push(Value::from(class.to_string()));
            sql.push_str(&format!(" AND property_class = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY distress_composite IS NULL, distress_composite DESC");
        if let Some(limit) = limit {
            values.push(Value::from(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok(VacancyParcel {
                    parcel_id: row.get(0)?,
                    county: row.get(1)?,
                    state_code: row.get(2)?,
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                    situs_address: row.get(5)?,
                    distress_composite: row.get(6)?,
                    mailing_city: row.get(7)?,
                    mailing_state: row.get(8)?,
                    mailing_zip: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pass-2.5 inputs: distress composite + vacancy state + motivation
    /// signal aggregates, joined at read time. `mc_raw` is
    /// Σ weight · clamp(confidence, 0, 1) over active, unexpired signals.
    pub fn select_conviction_inputs(
        &self,
        county: &str,
        state: &str,
        include_motivation: bool,
    ) -> anyhow::Result<Vec<ConvictionParcel>> {
        let conn = self.connect()?;
        if !include_motivation {
            let mut stmt = conn.prepare(
                "SELECT parcel_id, distress_composite, flag_vacancy, vacancy_confidence, usps_error
                 FROM parcels_core WHERE county = ?1 AND state_code = ?2",
            )?;
            let rows = stmt
                .query_map(params![county, state], |row| {
                    Ok(ConvictionParcel {
                        parcel_id: row.get(0)?,
                        distress_composite: row.get(1)?,
                        flag_vacancy: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
                        vacancy_confidence: row.get(3)?,
                        usps_error: row.get(4)?,
                        mc_raw: 0.0,
                        mc_count: 0,
                        mc_codes: None,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(rows);
        }

        let mut stmt = conn.prepare(
            "SELECT g.parcel_id, g.distress_composite, g.flag_vacancy,
                    g.vacancy_confidence, g.usps_error,
                    COALESCE(SUM(ms.weight * MAX(MIN(ms.confidence, 1.0), 0.0)), 0.0),
                    COUNT(ms.parcel_ref),
                    GROUP_CONCAT(DISTINCT ms.code)
             FROM parcels_core g
             LEFT JOIN motivation_signals ms
               ON ms.parcel_ref = g.parcel_id
              AND ms.active = 1
              AND (ms.expires_at IS NULL OR ms.expires_at > ?3)
             WHERE g.county = ?1 AND g.state_code = ?2
             GROUP BY g.parcel_id, g.distress_composite, g.flag_vacancy,
                      g.vacancy_confidence, g.usps_error",
        )?;
        let rows = stmt
            .query_map(params![county, state, now_timestamp()], |row| {
                Ok(ConvictionParcel {
                    parcel_id: row.get(0)?,
                    distress_composite: row.get(1)?,
                    flag_vacancy: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
                    vacancy_confidence: row.get(3)?,
                    usps_error: row.get(4)?,
                    mc_raw: row.get(5)?,
                    mc_count: row.get(6)?,
                    mc_codes: row.get::<_, Option<String>>(7)?.map(sort_codes),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All non-null slopes in a county, for percentile ranking.
    pub fn select_slopes(&self, county: &str) -> anyhow::Result<Vec<(String, f64)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT parcel_id, ndvi_slope_per_year FROM parcels_core
             WHERE county = ?1 AND ndvi_slope_per_year IS NOT NULL
             ORDER BY parcel_id",
        )?;
        let rows = stmt
            .query_map(params![county], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Composite inputs: parcels where slope or flood data is known.
    pub fn select_composite_inputs(&self, county: &str) -> anyhow::Result<Vec<CompositeInput>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT parcel_id, ndvi_slope_pctile, fema_risk, fema_sfha, fema_zone
             FROM parcels_core
             WHERE county = ?1
               AND (ndvi_slope_per_year IS NOT NULL OR fema_zone IS NOT NULL)",
        )?;
        let rows = stmt
            .query_map(params![county], |row| {
                Ok(CompositeInput {
                    parcel_id: row.get(0)?,
                    slope_pctile: row.get(1)?,
                    fema_risk: row.get(2)?,
                    fema_sfha: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                    has_fema: row.get::<_, Option<String>>(4)?.is_some(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Batched writes ──
    // Each chunk commits in its own transaction on a connection opened for
    // this flush. Later chunks may land before earlier ones across
    // concurrent flushes; within a chunk visibility is all-or-nothing.

    pub fn update_batch_scan(&self, rows: &[ScanResult]) -> anyhow::Result<usize> {
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        ndvi_current = ?1, ndvi_date = ?2, ndvi_category = ?3,
                        fema_zone = ?4, fema_risk = ?5, fema_sfha = ?6,
                        distress_score = ?7, distress_flags = ?8,
                        flag_veg_overgrowth = ?9, flag_veg_neglect = ?10,
                        flag_flood = ?11, flag_structural = ?12,
                        veg_confidence = ?13, flood_confidence = ?14,
                        scan_date = ?15,
                        scan_pass = MAX(COALESCE(scan_pass, 0), ?16),
                        sentinel_worthy = ?17
                     WHERE parcel_id = ?18 AND county = ?19",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.ndvi_current,
                        r.ndvi_date,
                        r.ndvi_category.as_str(),
                        r.fema_zone,
                        r.fema_risk,
                        r.fema_sfha,
                        r.distress_score,
                        r.distress_flags,
                        r.flag_veg_overgrowth,
                        r.flag_veg_neglect,
                        r.flag_flood,
                        r.flag_structural,
                        r.veg_confidence,
                        r.flood_confidence,
                        r.scan_date,
                        r.scan_pass,
                        r.sentinel_worthy,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }
        tracing::info!(submitted = rows.len(), written, "scan batch written");
        Ok(written)
    }

    pub fn update_batch_slope(&self, rows: &[SlopeResult]) -> anyhow::Result<usize> {
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        ndvi_slope_per_year = ?1,
                        ndvi_history_count = ?2,
                        ndvi_history_years = ?3
                     WHERE parcel_id = ?4 AND county = ?5",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.ndvi_slope_per_year,
                        r.ndvi_history_count,
                        r.ndvi_history_years,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    pub fn update_batch_trend(&self, rows: &[TrendResult]) -> anyhow::Result<usize> {
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        sentinel_trend_direction = ?1, sentinel_trend_slope = ?2,
                        sentinel_latest_ndvi = ?3, sentinel_months_data = ?4,
                        sentinel_mean_ndvi = ?5, sentinel_data_source = ?6,
                        sentinel_chart_url = ?7, sentinel_scan_date = ?8,
                        distress_score = ?9, distress_flags = ?10,
                        flag_veg_overgrowth = ?11, flag_veg_neglect = ?12,
                        flag_flood = ?13, flag_structural = ?14,
                        veg_confidence = ?15, flood_confidence = ?16,
                        scan_pass = MAX(COALESCE(scan_pass, 0), ?17)
                     WHERE parcel_id = ?18 AND county = ?19",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.sentinel_trend_direction.as_str(),
                        r.sentinel_trend_slope,
                        r.sentinel_latest_ndvi,
                        r.sentinel_months_data,
                        r.sentinel_mean_ndvi,
                        r.sentinel_data_source.map(|s| s.as_str()),
                        r.sentinel_chart_url,
                        r.sentinel_scan_date,
                        r.distress_score,
                        r.distress_flags,
                        r.flag_veg_overgrowth,
                        r.flag_veg_neglect,
                        r.flag_flood,
                        r.flag_structural,
                        r.veg_confidence,
                        r.flood_confidence,
                        r.scan_pass,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    pub fn update_batch_scene(&self, rows: &[SceneResult]) -> anyhow::Result<usize> {
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        planet_scene_count = ?1, planet_change_score = ?2,
                        planet_temporal_span_days = ?3, planet_latest_date = ?4,
                        planet_earliest_date = ?5, planet_thumb_latest_url = ?6,
                        planet_thumb_earliest_url = ?7, planet_scan_date = ?8
                     WHERE parcel_id = ?9 AND county = ?10",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.planet_scene_count,
                        r.planet_change_score,
                        r.planet_temporal_span_days,
                        r.planet_latest_date,
                        r.planet_earliest_date,
                        r.planet_thumb_latest_url,
                        r.planet_thumb_earliest_url,
                        r.planet_scan_date,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    /// Vacancy results split three ways:
    /// - success: full column set, `usps_check_date` stamped, error cleared
    /// - transient error: error recorded, check date left NULL (retry-eligible)
    /// - permanent error: error recorded AND check date stamped, so known-bad
    ///   addresses stop burning quota
    pub fn update_batch_usps(&self, rows: &[UspsResult]) -> anyhow::Result<usize> {
        let mut success = Vec::new();
        let mut transient = Vec::new();
        let mut permanent = Vec::new();
        for r in rows {
            match &r.usps_error {
                None => success.push(r),
                Some(code) if is_transient_usps_error(code) => transient.push(r),
                Some(_) => permanent.push(r),
            }
        }

        let now = now_timestamp();
        let mut conn = self.connect()?;
        let mut written = 0;

        for chunk in success.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        usps_vacant = ?1, usps_dpv_confirmed = ?2, usps_address = ?3,
                        usps_city = ?4, usps_zip = ?5, usps_zip4 = ?6,
                        usps_business = ?7, usps_carrier_route = ?8,
                        usps_address_mismatch = ?9, usps_check_date = ?10,
                        usps_error = NULL, flag_vacancy = ?11, vacancy_confidence = ?12
                     WHERE parcel_id = ?13 AND county = ?14",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.usps_vacant,
                        r.usps_dpv_confirmed,
                        r.usps_address,
                        r.usps_city,
                        r.usps_zip,
                        r.usps_zip4,
                        r.usps_business,
                        r.usps_carrier_route,
                        r.usps_address_mismatch,
                        now,
                        r.flag_vacancy,
                        r.vacancy_confidence,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }

        for chunk in transient.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        usps_error = ?1, flag_vacancy = 0, vacancy_confidence = NULL
                     WHERE parcel_id = ?2 AND county = ?3",
                )?;
                for r in chunk {
                    written += stmt.execute(params![r.usps_error, r.parcel_id, r.county])?;
                }
            }
            tx.commit()?;
        }

        for chunk in permanent.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        usps_error = ?1, usps_check_date = ?2,
                        flag_vacancy = 0, vacancy_confidence = NULL
                     WHERE parcel_id = ?3 AND county = ?4",
                )?;
                for r in chunk {
                    written += stmt.execute(params![r.usps_error, now, r.parcel_id, r.county])?;
                }
            }
            tx.commit()?;
        }

        tracing::info!(
            total = rows.len(),
            success = success.len(),
            transient = transient.len(),
            permanent = permanent.len(),
            "usps batch written"
        );
        Ok(written)
    }

    pub fn update_batch_pctile(
        &self,
        county: &str,
        rows: &[(String, f64)],
    ) -> anyhow::Result<usize> {
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET ndvi_slope_pctile = ?1
                     WHERE parcel_id = ?2 AND county = ?3",
                )?;
                for (parcel_id, pctile) in chunk {
                    written += stmt.execute(params![pctile, parcel_id, county])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    pub fn update_batch_composite(
        &self,
        county: &str,
        rows: &[(String, f64)],
    ) -> anyhow::Result<usize> {
        let now = now_timestamp();
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET distress_composite = ?1, composite_date = ?2
                     WHERE parcel_id = ?3 AND county = ?4",
                )?;
                for (parcel_id, composite) in chunk {
                    written += stmt.execute(params![composite, now, parcel_id, county])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }

    pub fn update_batch_conviction(&self, rows: &[ConvictionResult]) -> anyhow::Result<usize> {
        let now = now_timestamp();
        let mut conn = self.connect()?;
        let mut written = 0;
        for chunk in rows.chunks(CHUNK_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE parcels_core SET
                        conviction_score = ?1, conviction_base_score = ?2,
                        conviction_vacancy_bonus = ?3, conviction_mc_score = ?4,
                        conviction_mc_signals = ?5, conviction_mc_codes = ?6,
                        conviction_components = ?7, conviction_date = ?8
                     WHERE parcel_id = ?9 AND county = ?10",
                )?;
                for r in chunk {
                    written += stmt.execute(params![
                        r.conviction_score,
                        r.conviction_base_score,
                        r.conviction_vacancy_bonus,
                        r.conviction_mc_score,
                        r.conviction_mc_signals,
                        r.conviction_mc_codes,
                        r.conviction_components,
                        now,
                        r.parcel_id,
                        r.county,
                    ])?;
                }
            }
            tx.commit()?;
        }
        Ok(written)
    }
}

#[derive(Debug, Clone)]
pub struct CompositeInput {
    pub parcel_id: String,
    pub slope_pctile: Option<f64>,
    pub fema_risk: Option<String>,
    pub fema_sfha: bool,
    pub has_fema: bool,
}

fn sort_codes(csv: String) -> String {
    let mut codes: Vec<&str> = csv.split(',').filter(|s| !s.is_empty()).collect();
    codes.sort_unstable();
    codes.dedup();
    codes.join(",")
}

/// Deterministic pseudo-random ordering key: hex sha256 of the parcel id.
fn register_parcel_hash(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "parcel_hash",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let input: String = ctx.get(0)?;
            let digest = Sha256::digest(input.as_bytes());
            Ok(digest
                .iter()
                .take(8)
                .map(|b| format!("{b:02x}"))
                .collect::<String>())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parcel::NdviCategory;

    fn test_store() -> (tempfile::TempDir, ParcelStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ParcelStore::new(dir.path().join("parcels.db"));
        store.migrate().unwrap();
        (dir, store)
    }

    fn seed(store: &ParcelStore, parcel_id: &str, county: &str) {
        let conn = store.connect().unwrap();
        conn.execute(
            "INSERT INTO parcels_core
                (county, state_code, parcel_id, latitude, longitude, situs_address)
             VALUES (?1, 'NC', ?2, 35.2271, -80.8431, '123 MAIN ST DALLAS NC')",
            params![county, parcel_id],
        )
        .unwrap();
    }

    fn scan_result(parcel_id: &str, county: &str) -> ScanResult {
        ScanResult {
            parcel_id: parcel_id.into(),
            county: county.into(),
            ndvi_current: Some(0.23),
            ndvi_date: Some("2022-06-15".into()),
            ndvi_category: NdviCategory::Minimal,
            fema_zone: Some("X".into()),
            fema_risk: Some("low".into()),
            fema_sfha: false,
            distress_score: Some(0.83),
            distress_flags: Some("vegetation_neglect".into()),
            flag_veg_overgrowth: false,
            flag_veg_neglect: true,
            flag_flood: false,
            flag_structural: false,
            veg_confidence: Some(0.55),
            flood_confidence: None,
            scan_date: now_timestamp(),
            scan_pass: 1.0,
            sentinel_worthy: true,
        }
    }

    #[test]
    fn test_unscanned_excludes_scanned_rows() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        seed(&store, "P2", "CtyA");

        assert_eq!(store.select_unscanned("CtyA", None, None, None).unwrap().len(), 2);

        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();

        let remaining = store.select_unscanned("CtyA", None, None, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].parcel_id, "P2");
    }

    #[test]
    fn test_unscanned_ordering_is_deterministic() {
        let (_dir, store) = test_store();
        for i in 0..20 {
            seed(&store, &format!("P{i}"), "CtyA");
        }
        let a = store.select_unscanned("CtyA", None, None, None).unwrap();
        let b = store.select_unscanned("CtyA", None, None, None).unwrap();
        let ids_a: Vec<_> = a.iter().map(|p| &p.parcel_id).collect();
        let ids_b: Vec<_> = b.iter().map(|p| &p.parcel_id).collect();
        assert_eq!(ids_a, ids_b);
        // Hash order should not be insertion order for 20 ids.
        let sequential: Vec<String> = (0..20).map(|i| format!("P{i}")).collect();
        let got: Vec<String> = a.iter().map(|p| p.parcel_id.clone()).collect();
        assert_ne!(got, sequential);
    }

    #[test]
    fn test_scan_pass_is_monotone() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");

        let mut r = scan_result("P1", "CtyA");
        r.scan_pass = 2.0;
        store.update_batch_scan(&[r]).unwrap();

        // Re-running pass 1 must not lower the level.
        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();

        let conn = store.connect().unwrap();
        let pass: f64 = conn
            .query_row(
                "SELECT scan_pass FROM parcels_core WHERE parcel_id = 'P1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(pass, 2.0);
    }

    #[test]
    fn test_pass1_rerun_leaves_later_columns_intact() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();
        store
            .update_batch_slope(&[SlopeResult {
                parcel_id: "P1".into(),
                county: "CtyA".into(),
                ndvi_slope_per_year: Some(0.026),
                ndvi_history_count: 5,
                ndvi_history_years: Some("2014,2016,2018,2020,2022".into()),
            }])
            .unwrap();

        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();

        let conn = store.connect().unwrap();
        let slope: Option<f64> = conn
            .query_row(
                "SELECT ndvi_slope_per_year FROM parcels_core WHERE parcel_id = 'P1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(slope, Some(0.026));
    }

    #[test]
    fn test_slope_selector_predicate() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        seed(&store, "P2", "CtyA");
        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();

        // Only P1 has NDVI; P2 is unscanned.
        let needing = store.select_needing_slope("CtyA", None, None).unwrap();
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].parcel_id, "P1");

        store
            .update_batch_slope(&[SlopeResult {
                parcel_id: "P1".into(),
                county: "CtyA".into(),
                ndvi_slope_per_year: Some(0.01),
                ndvi_history_count: 3,
                ndvi_history_years: Some("2018,2020,2022".into()),
            }])
            .unwrap();
        assert!(store.select_needing_slope("CtyA", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_sentinel_worthy_selector() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        store.update_batch_scan(&[scan_result("P1", "CtyA")]).unwrap();

        let worthy = store.select_sentinel_worthy("CtyA", None, None).unwrap();
        assert_eq!(worthy.len(), 1);

        // After enrichment, the parcel drops out of the queue.
        let trend = TrendResult {
            parcel_id: "P1".into(),
            county: "CtyA".into(),
            sentinel_trend_direction: TrendDirection::Stable,
            sentinel_trend_slope: Some(0.001),
            sentinel_latest_ndvi: Some(0.4),
            sentinel_months_data: 10,
            sentinel_mean_ndvi: Some(0.38),
            sentinel_data_source: Some(TrendSource::Primary),
            sentinel_chart_url: None,
            sentinel_scan_date: now_timestamp(),
            distress_score: Some(0.83),
            distress_flags: Some("vegetation_neglect".into()),
            flag_veg_overgrowth: false,
            flag_veg_neglect: true,
            flag_flood: false,
            flag_structural: false,
            veg_confidence: Some(0.55),
            flood_confidence: None,
            scan_pass: 2.0,
        };
        store.update_batch_trend(&[trend]).unwrap();
        assert!(store.select_sentinel_worthy("CtyA", None, None).unwrap().is_empty());
    }

    #[test]
    fn test_usps_three_way_split() {
        let (_dir, store) = test_store();
        for id in ["OK", "TRANSIENT", "PERMANENT"] {
            seed(&store, id, "CtyA");
            let mut r = scan_result(id, "CtyA");
            r.parcel_id = id.into();
            store.update_batch_scan(&[r]).unwrap();
        }

        let base = UspsResult {
            parcel_id: "OK".into(),
            county: "CtyA".into(),
            account: Some(1),
            usps_vacant: Some(true),
            usps_dpv_confirmed: Some(true),
            usps_address: Some("123 MAIN ST".into()),
            usps_city: Some("DALLAS".into()),
            usps_zip: Some("28034".into()),
            usps_zip4: None,
            usps_business: Some(false),
            usps_carrier_route: Some("R001".into()),
            usps_address_mismatch: false,
            usps_error: None,
            flag_vacancy: true,
            vacancy_confidence: Some(0.9),
        };
        let transient = UspsResult {
            parcel_id: "TRANSIENT".into(),
            usps_error: Some("rate_limited".into()),
            flag_vacancy: false,
            vacancy_confidence: None,
            ..base.clone()
        };
        let permanent = UspsResult {
            parcel_id: "PERMANENT".into(),
            usps_error: Some("address_invalid: no match".into()),
            flag_vacancy: false,
            vacancy_confidence: None,
            ..base.clone()
        };
        store
            .update_batch_usps(&[base, transient, permanent])
            .unwrap();

        let conn = store.connect().unwrap();
        let get = |id: &str| -> (Option<String>, Option<String>) {
            conn.query_row(
                "SELECT usps_check_date, usps_error FROM parcels_core WHERE parcel_id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
        };

        let (ok_date, ok_err) = get("OK");
        assert!(ok_date.is_some());
        assert!(ok_err.is_none());

        // Transient: retry-eligible (date NULL, error set).
        let (tr_date, tr_err) = get("TRANSIENT");
        assert!(tr_date.is_none());
        assert_eq!(tr_err.as_deref(), Some("rate_limited"));

        // Permanent: poison-prevention (date set, error set).
        let (pm_date, pm_err) = get("PERMANENT");
        assert!(pm_date.is_some());
        assert!(pm_err.is_some());
    }

    #[test]
    fn test_usps_selector_retry_and_staleness() {
        let (_dir, store) = test_store();
        for id in ["FRESH", "RETRY", "NEVER"] {
            seed(&store, id, "CtyA");
        }
        let conn = store.connect().unwrap();
        conn.execute_batch(
            "UPDATE parcels_core SET distress_composite = 8.0;
             UPDATE parcels_core SET usps_check_date = datetime('now') WHERE parcel_id = 'FRESH';
             UPDATE parcels_core SET usps_error = 'http_503' WHERE parcel_id = 'RETRY';",
        )
        .unwrap();

        let eligible = store
            .select_needing_usps("CtyA", None, None, 7.0, 60, None)
            .unwrap();
        let ids: Vec<_> = eligible.iter().map(|p| p.parcel_id.as_str()).collect();
        assert!(ids.contains(&"RETRY"));
        assert!(ids.contains(&"NEVER"));
        assert!(!ids.contains(&"FRESH"));
    }

    #[test]
    fn test_usps_min_composite_filter() {
        let (_dir, store) = test_store();
        seed(&store, "LOW", "CtyA");
        seed(&store, "HIGH", "CtyA");
        let conn = store.connect().unwrap();
        conn.execute_batch(
            "UPDATE parcels_core SET distress_composite = 3.0 WHERE parcel_id = 'LOW';
             UPDATE parcels_core SET distress_composite = 8.5 WHERE parcel_id = 'HIGH';",
        )
        .unwrap();
        let eligible = store
            .select_needing_usps("CtyA", None, None, 7.0, 60, None)
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].parcel_id, "HIGH");
    }

    #[test]
    fn test_conviction_join_aggregates_motivation() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        let conn = store.connect().unwrap();
        conn.execute_batch(
            "INSERT INTO motivation_signals (parcel_ref, weight, confidence, code, active)
             VALUES ('P1', 2.0, 0.9, 'tax_lien', 1),
                    ('P1', 1.5, 1.4, 'code_violation', 1),
                    ('P1', 9.0, 1.0, 'expired', 1),
                    ('P1', 9.0, 1.0, 'inactive', 0);
             UPDATE motivation_signals SET expires_at = '2000-01-01 00:00:00'
             WHERE code = 'expired';",
        )
        .unwrap();

        let rows = store.select_conviction_inputs("CtyA", "NC", true).unwrap();
        assert_eq!(rows.len(), 1);
        let p = &rows[0];
        // 2.0*0.9 + 1.5*clamp(1.4)=1.5 -> 3.3; expired/inactive excluded
        assert!((p.mc_raw - 3.3).abs() < 1e-9);
        assert_eq!(p.mc_count, 2);
        assert_eq!(p.mc_codes.as_deref(), Some("code_violation,tax_lien"));
    }

    #[test]
    fn test_conviction_without_motivation() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        let rows = store.select_conviction_inputs("CtyA", "NC", false).unwrap();
        assert_eq!(rows[0].mc_count, 0);
        assert_eq!(rows[0].mc_raw, 0.0);
    }

    #[test]
    fn test_scene_recency_gate() {
        let (_dir, store) = test_store();
        seed(&store, "RECENT", "CtyA");
        seed(&store, "STALE", "CtyA");
        let conn = store.connect().unwrap();
        conn.execute_batch(
            "UPDATE parcels_core SET scan_date = datetime('now');
             UPDATE parcels_core SET planet_scan_date = datetime('now') WHERE parcel_id = 'RECENT';
             UPDATE parcels_core SET planet_scan_date = '2020-01-01 00:00:00' WHERE parcel_id = 'STALE';",
        )
        .unwrap();

        let gated = store.select_for_scenes("CtyA", None, false, 60).unwrap();
        let ids: Vec<_> = gated.iter().map(|p| p.parcel_id.as_str()).collect();
        assert_eq!(ids, vec!["STALE"]);

        let forced = store.select_for_scenes("CtyA", None, true, 60).unwrap();
        assert_eq!(forced.len(), 2);
    }

    #[test]
    fn test_transient_error_classification() {
        assert!(is_transient_usps_error("rate_limited"));
        assert!(is_transient_usps_error("http_503"));
        assert!(is_transient_usps_error("timeout"));
        assert!(is_transient_usps_error("network: dns failure"));
        assert!(!is_transient_usps_error("http_404"));
        assert!(!is_transient_usps_error("address_invalid: bad"));
    }

    #[test]
    fn test_pctile_and_composite_updates() {
        let (_dir, store) = test_store();
        seed(&store, "P1", "CtyA");
        store
            .update_batch_slope(&[SlopeResult {
                parcel_id: "P1".into(),
                county: "CtyA".into(),
                ndvi_slope_per_year: Some(0.02),
                ndvi_history_count: 4,
                ndvi_history_years: Some("2016,2018,2020,2022".into()),
            }])
            .unwrap();

        let slopes = store.select_slopes("CtyA").unwrap();
        assert_eq!(slopes, vec![("P1".to_string(), 0.02)]);

        store
            .update_batch_pctile("CtyA", &[("P1".to_string(), 100.0)])
            .unwrap();
        store
            .update_batch_composite("CtyA", &[("P1".to_string(), 7.0)])
            .unwrap();

        let inputs = store.select_composite_inputs("CtyA").unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].slope_pctile, Some(100.0));
        assert!(!inputs[0].has_fema);
    }
}
