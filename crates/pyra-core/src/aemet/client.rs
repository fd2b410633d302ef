// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! CSAPI client for the AEMET enclosure datalogger.
//!
//! The datalogger speaks a small HTTP API: `DataQuery` returns the public
//! register table as `head.fields` + `data[].vals`, `SetValueEx` writes a
//! single register. The EM27 is powered through a separate network power
//! plug.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{AemetEnclosureConfig, PowerPlugConfig};
use crate::error::{PyraError, Result};
use crate::state::AemetEnclosureState;

/// A cached snapshot older than this is no substitute for a failed read.
pub const SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(180);

/// Pause between clear-fault attempts; the logger needs a full scan cycle
/// to drop the fault register.
pub const CLEAR_FAULT_PAUSE: Duration = Duration::from_secs(30);

const CLEAR_FAULT_ATTEMPTS: usize = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn datalogger_error(details: impl Into<String>) -> PyraError {
    PyraError::Datalogger {
        details: details.into(),
    }
}

#[derive(Debug, Deserialize)]
struct DataQueryResponse {
    head: DataQueryHead,
    data: Vec<DataQueryRow>,
}

#[derive(Debug, Deserialize)]
struct DataQueryHead {
    fields: Vec<DataQueryField>,
}

#[derive(Debug, Deserialize)]
struct DataQueryField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DataQueryRow {
    vals: Vec<serde_json::Value>,
}

/// Map the last `DataQuery` row into named register values.
fn registers_from_response(response: &DataQueryResponse) -> Result<HashMap<String, f64>> {
    let row = response
        .data
        .last()
        .ok_or_else(|| datalogger_error("DataQuery returned no rows"))?;
    if row.vals.len() != response.head.fields.len() {
        return Err(datalogger_error(format!(
            "DataQuery row has {} values for {} fields",
            row.vals.len(),
            response.head.fields.len()
        )));
    }
    let mut registers = HashMap::new();
    for (field, value) in response.head.fields.iter().zip(&row.vals) {
        if let Some(number) = value.as_f64() {
            registers.insert(field.name.clone(), number);
        }
    }
    Ok(registers)
}

/// Decode a register table into a snapshot. Boolean registers are 0/1.
pub(crate) fn snapshot_from_registers(registers: &HashMap<String, f64>) -> AemetEnclosureState {
    let flag = |name: &str| registers.get(name).map(|v| *v != 0.0);
    let int = |name: &str| registers.get(name).map(|v| *v as i64);
    let float = |name: &str| registers.get(name).copied();
    AemetEnclosureState {
        last_full_fetch: Some(Utc::now()),
        auto_mode: flag("auto_mode"),
        enhanced_security_mode: flag("enhanced_security_mode"),
        cover_is_open: flag("cover_is_open"),
        alert_level: int("alert_level"),
        averia_fault_code: int("averia"),
        rain: flag("rain"),
        wind_speed: float("wind_speed"),
        temperature: float("temperature"),
        humidity: float("humidity"),
        em27_powered: None,
    }
}

/// Cover motion is permitted only below alert level 2 and with a clear
/// fault register.
pub(crate) fn cover_moves_allowed(snapshot: &AemetEnclosureState) -> bool {
    snapshot.alert_level.map(|level| level < 2).unwrap_or(false)
        && snapshot.averia_fault_code == Some(0)
}

fn snapshot_is_fresh(snapshot: &AemetEnclosureState) -> bool {
    snapshot
        .last_full_fetch
        .map(|fetched| {
            (Utc::now() - fetched).to_std().unwrap_or(Duration::MAX) < SNAPSHOT_MAX_AGE
        })
        .unwrap_or(false)
}

pub struct AemetDatalogger {
    http: reqwest::Client,
    config: AemetEnclosureConfig,
    cached: Option<AemetEnclosureState>,
}

impl AemetDatalogger {
    pub fn new(config: AemetEnclosureConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| datalogger_error(e.to_string()))?;
        Ok(Self {
            http,
            config,
            cached: None,
        })
    }

    /// Replace the config; the client is stateless per request so no
    /// reconnect is needed.
    pub fn update_config(&mut self, new_config: AemetEnclosureConfig) {
        if new_config.datalogger_ip != self.config.datalogger_ip
            || new_config.datalogger_port != self.config.datalogger_port
        {
            self.cached = None;
        }
        self.config = new_config;
    }

    fn base_url(&self) -> String {
        format!(
            "http://{}:{}/csapi/",
            self.config.datalogger_ip, self.config.datalogger_port
        )
    }

    async fn data_query(&self) -> Result<HashMap<String, f64>> {
        let response = self
            .http
            .get(self.base_url())
            .query(&[
                ("command", "DataQuery"),
                ("uri", "dl:Public"),
                ("format", "json"),
                ("mode", "most-recent"),
            ])
            .basic_auth(
                &self.config.datalogger_username,
                Some(&self.config.datalogger_password),
            )
            .send()
            .await
            .map_err(|e| datalogger_error(format!("DataQuery failed: {}", e)))?
            .error_for_status()
            .map_err(|e| datalogger_error(format!("DataQuery rejected: {}", e)))?
            .json::<DataQueryResponse>()
            .await
            .map_err(|e| datalogger_error(format!("DataQuery unparsable: {}", e)))?;
        registers_from_response(&response)
    }

    async fn set_value(&self, name: &str, value: f64) -> Result<()> {
        let uri = format!("dl:Public.{}", name);
        let value_string = value.to_string();
        self.http
            .get(self.base_url())
            .query(&[
                ("command", "SetValueEx"),
                ("format", "json"),
                ("uri", uri.as_str()),
                ("value", value_string.as_str()),
            ])
            .basic_auth(
                &self.config.datalogger_username,
                Some(&self.config.datalogger_password),
            )
            .send()
            .await
            .map_err(|e| datalogger_error(format!("SetValueEx {} failed: {}", name, e)))?
            .error_for_status()
            .map_err(|e| datalogger_error(format!("SetValueEx {} rejected: {}", name, e)))?;
        debug!(register = name, value, "Datalogger register written");
        Ok(())
    }

    /// Fetch a fresh snapshot; fall back to a sub-3-minute cache when the
    /// logger returns garbage or nothing.
    pub async fn read(&mut self) -> Result<AemetEnclosureState> {
        match self.data_query().await {
            Ok(registers) => {
                let snapshot = snapshot_from_registers(&registers);
                self.cached = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(error) => match self.cached.as_ref() {
                Some(snapshot) if snapshot_is_fresh(snapshot) => {
                    warn!(error = %error, "Datalogger read failed, serving cached snapshot");
                    Ok(snapshot.clone())
                }
                _ => Err(error),
            },
        }
    }

    pub async fn set_auto_mode(&self, value: bool) -> Result<()> {
        self.set_value("auto_mode", if value { 1.0 } else { 0.0 }).await
    }

    pub async fn set_enhanced_security_mode(&self, value: bool) -> Result<()> {
        self.set_value("enhanced_security_mode", if value { 1.0 } else { 0.0 })
            .await
    }

    pub async fn set_alert_level(&self, level: i64) -> Result<()> {
        self.set_value("alert_level", level as f64).await
    }

    pub async fn set_averia_fault_code(&self, code: i64) -> Result<()> {
        self.set_value("averia", code as f64).await
    }

    /// Drop a latched fault: manual mode, zero the register, wait a scan
    /// cycle, re-read. Up to three rounds.
    pub async fn clear_fault(&mut self) -> Result<()> {
        self.clear_fault_with(CLEAR_FAULT_PAUSE).await
    }

    pub async fn clear_fault_with(&mut self, pause: Duration) -> Result<()> {
        for attempt in 1..=CLEAR_FAULT_ATTEMPTS {
            self.set_auto_mode(false).await?;
            self.set_averia_fault_code(0).await?;
            tokio::time::sleep(pause).await;
            let snapshot = self.read().await?;
            if snapshot.averia_fault_code == Some(0) {
                info!(attempt, "Datalogger fault cleared");
                return Ok(());
            }
            warn!(
                attempt,
                fault = ?snapshot.averia_fault_code,
                "Datalogger fault still latched"
            );
        }
        Err(datalogger_error("fault register stayed nonzero after 3 clear attempts"))
    }

    async fn move_cover(&mut self, open: bool) -> Result<()> {
        let snapshot = self.read().await?;
        if snapshot.averia_fault_code.unwrap_or(0) != 0 {
            self.clear_fault().await?;
        }
        let snapshot = self.read().await?;
        if !cover_moves_allowed(&snapshot) {
            return Err(datalogger_error(format!(
                "cover move blocked (alert level {:?}, fault {:?})",
                snapshot.alert_level, snapshot.averia_fault_code
            )));
        }
        self.set_value("cover_is_open", if open { 1.0 } else { 0.0 })
            .await
    }

    pub async fn open_cover(&mut self) -> Result<()> {
        self.move_cover(true).await
    }

    pub async fn close_cover(&mut self) -> Result<()> {
        self.move_cover(false).await
    }

    #[cfg(test)]
    pub(crate) fn inject_cached(&mut self, snapshot: AemetEnclosureState) {
        self.cached = Some(snapshot);
    }
}

/// Tasmota-style network power plug feeding the EM27.
pub struct Em27PowerPlug {
    http: reqwest::Client,
    config: PowerPlugConfig,
}

impl Em27PowerPlug {
    pub fn new(config: PowerPlugConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| datalogger_error(e.to_string()))?;
        Ok(Self { http, config })
    }

    pub async fn set_power(&self, on: bool) -> Result<()> {
        let command = if on { "Power On" } else { "Power Off" };
        self.http
            .get(format!("http://{}:{}/cm", self.config.host, self.config.port))
            .query(&[("cmnd", command)])
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| datalogger_error(format!("power plug unreachable: {}", e)))?
            .error_for_status()
            .map_err(|e| datalogger_error(format!("power plug rejected command: {}", e)))?;
        info!(on, "EM27 power plug switched");
        Ok(())
    }
}
