//! # Journey Engine
//!
//! Stateful holder of the current (agent, date range, snapshot) and of every
//! output derived from them. State changes arrive as [`EngineCommand`]s; each
//! command marks the affected outputs dirty and reports what changed as
//! [`EngineEvent`]s. Outputs are recomputed on first access after a change,
//! never eagerly and never tied to a UI lifecycle.
//!
//! Snapshots carry the generation of the refresh cycle that produced them.
//! A snapshot whose generation is not newer than the loaded one is ignored,
//! as is a snapshot for an agent other than the selected one.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::bounds::ViewportIndex;
use crate::config::EngineConfig;
use crate::decluster::{decluster, MarkerGroup};
use crate::error::{OptionExt, Result};
use crate::metrics::{compute_journey_metrics, JourneyMetrics};
use crate::report::{journey_report, JourneyReportRow};
use crate::time_window::DateRange;
use crate::trends::{monthly_trend, region_distribution, RegionBucket, TrendBucket};
use crate::types::{ClientLocation, JourneySnapshot};
use crate::visits::VisitRecord;
use crate::Bounds;

/// State changes the engine accepts.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Replace the snapshot with the result of refresh cycle `generation`
    LoadSnapshot {
        generation: u64,
        snapshot: Arc<JourneySnapshot>,
    },
    SetDateRange(DateRange),
    /// Select another agent; drops the loaded snapshot
    SetAgent(String),
    SetConfig(EngineConfig),
    /// Drop the snapshot and every derived output
    Clear,
}

/// What a command changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    SnapshotLoaded { generation: u64, agent_id: String },
    /// The snapshot was not newer than the one already loaded
    StaleSnapshotIgnored { generation: u64, current: u64 },
    /// The snapshot belongs to an agent other than the selected one
    ForeignSnapshotIgnored { generation: u64, agent_id: String },
    AgentChanged { agent_id: String },
    DateRangeChanged { range: DateRange },
    MetricsChanged,
    MarkersChanged,
    TrendsChanged,
    Cleared,
}

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub generation: u64,
    pub ping_count: usize,
    pub meeting_count: usize,
    pub client_count: usize,
    pub visit_count: usize,
    pub client_marker_groups: usize,
    pub visit_marker_groups: usize,
}

// ============================================================================
// Journey Engine
// ============================================================================

/// Command-driven engine with lazily recomputed outputs.
pub struct JourneyEngine {
    // Query
    agent_id: Option<String>,
    range: DateRange,
    config: EngineConfig,

    // Input
    snapshot: Option<Arc<JourneySnapshot>>,
    generation: u64,

    // Derived outputs
    metrics: Result<JourneyMetrics>,
    client_markers: Vec<MarkerGroup<ClientLocation>>,
    visit_markers: Vec<MarkerGroup<VisitRecord>>,
    trend: Vec<TrendBucket>,
    distribution: Vec<RegionBucket>,
    client_index: ViewportIndex<ClientLocation>,

    // Dirty tracking
    metrics_dirty: bool,
    client_markers_dirty: bool,
    visit_markers_dirty: bool,
    trends_dirty: bool,
    spatial_dirty: bool,
}

impl JourneyEngine {
    /// Engine for today's date with default configuration.
    pub fn new() -> Self {
        Self::build(EngineConfig::default())
    }

    /// Engine for today's date with `config`, which must validate.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        Self {
            agent_id: None,
            range: DateRange::single_day(Utc::now().date_naive()),
            config,
            snapshot: None,
            generation: 0,
            metrics: Ok(JourneyMetrics::empty()),
            client_markers: Vec::new(),
            visit_markers: Vec::new(),
            trend: Vec::new(),
            distribution: Vec::new(),
            client_index: ViewportIndex::new(Vec::new()),
            metrics_dirty: true,
            client_markers_dirty: true,
            visit_markers_dirty: true,
            trends_dirty: true,
            spatial_dirty: true,
        }
    }

    /// Apply one command and report what changed.
    ///
    /// Fails only for a configuration that does not validate; the engine is
    /// left unchanged in that case.
    pub fn apply(&mut self, command: EngineCommand) -> Result<Vec<EngineEvent>> {
        let events = match command {
            EngineCommand::LoadSnapshot {
                generation,
                snapshot,
            } => self.load_snapshot(generation, snapshot),
            EngineCommand::SetDateRange(range) => self.set_date_range(range),
            EngineCommand::SetAgent(agent_id) => self.set_agent(agent_id),
            EngineCommand::SetConfig(config) => self.set_config(config)?,
            EngineCommand::Clear => self.clear(),
        };
        Ok(events)
    }

    fn load_snapshot(
        &mut self,
        generation: u64,
        mut snapshot: Arc<JourneySnapshot>,
    ) -> Vec<EngineEvent> {
        if generation <= self.generation {
            debug!(
                "[JourneyEngine] Ignoring generation {} (have {})",
                generation, self.generation
            );
            return vec![EngineEvent::StaleSnapshotIgnored {
                generation,
                current: self.generation,
            }];
        }
        if let Some(agent_id) = &self.agent_id {
            if *agent_id != snapshot.agent_id {
                debug!(
                    "[JourneyEngine] Ignoring generation {} for '{}' (selected '{}')",
                    generation, snapshot.agent_id, agent_id
                );
                return vec![EngineEvent::ForeignSnapshotIgnored {
                    generation,
                    agent_id: snapshot.agent_id.clone(),
                }];
            }
        }

        if snapshot.invalid_coordinate_count() > 0 {
            Arc::make_mut(&mut snapshot).sanitize();
        }

        info!(
            "[JourneyEngine] Loaded generation {} for '{}': {} pings, {} meetings, {} clients",
            generation,
            snapshot.agent_id,
            snapshot.pings.len(),
            snapshot.meetings.len(),
            snapshot.clients.len()
        );

        self.generation = generation;
        let agent_id = snapshot.agent_id.clone();
        if self.agent_id.is_none() {
            self.agent_id = Some(agent_id.clone());
        }
        self.snapshot = Some(snapshot);
        self.mark_all_dirty();

        vec![
            EngineEvent::SnapshotLoaded {
                generation,
                agent_id,
            },
            EngineEvent::MetricsChanged,
            EngineEvent::MarkersChanged,
            EngineEvent::TrendsChanged,
        ]
    }

    fn set_date_range(&mut self, range: DateRange) -> Vec<EngineEvent> {
        if range == self.range {
            return Vec::new();
        }
        self.range = range;
        self.metrics_dirty = true;
        self.visit_markers_dirty = true;
        vec![
            EngineEvent::DateRangeChanged { range },
            EngineEvent::MetricsChanged,
            EngineEvent::MarkersChanged,
        ]
    }

    fn set_agent(&mut self, agent_id: String) -> Vec<EngineEvent> {
        if self.agent_id.as_deref() == Some(agent_id.as_str()) {
            return Vec::new();
        }
        info!("[JourneyEngine] Agent changed to '{}'", agent_id);
        self.agent_id = Some(agent_id.clone());
        self.snapshot = None;
        self.mark_all_dirty();
        vec![
            EngineEvent::AgentChanged { agent_id },
            EngineEvent::MetricsChanged,
            EngineEvent::MarkersChanged,
            EngineEvent::TrendsChanged,
        ]
    }

    fn set_config(&mut self, config: EngineConfig) -> Result<Vec<EngineEvent>> {
        config.validate()?;

        let mut events = Vec::new();
        let metrics_changed = config.verification != self.config.verification
            || config.route_simplification_deg != self.config.route_simplification_deg;
        let markers_changed = metrics_changed || config.decluster != self.config.decluster;
        let trends_changed = config.trends != self.config.trends;

        if metrics_changed {
            self.metrics_dirty = true;
            events.push(EngineEvent::MetricsChanged);
        }
        if markers_changed {
            self.client_markers_dirty = true;
            self.visit_markers_dirty = true;
            events.push(EngineEvent::MarkersChanged);
        }
        if trends_changed {
            self.trends_dirty = true;
            events.push(EngineEvent::TrendsChanged);
        }

        self.config = config;
        Ok(events)
    }

    /// Drop the snapshot and every derived output.
    ///
    /// The generation is kept, so results of cycles started before the clear
    /// are still rejected.
    fn clear(&mut self) -> Vec<EngineEvent> {
        self.snapshot = None;
        self.metrics = Ok(JourneyMetrics::empty());
        self.client_markers.clear();
        self.visit_markers.clear();
        self.trend.clear();
        self.distribution.clear();
        self.client_index = ViewportIndex::new(Vec::new());
        self.mark_all_dirty();
        info!("[JourneyEngine] Cleared");
        vec![EngineEvent::Cleared]
    }

    fn mark_all_dirty(&mut self) {
        self.metrics_dirty = true;
        self.client_markers_dirty = true;
        self.visit_markers_dirty = true;
        self.trends_dirty = true;
        self.spatial_dirty = true;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn date_range(&self) -> DateRange {
        self.range
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generation of the loaded snapshot, 0 if none was ever loaded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> Option<&Arc<JourneySnapshot>> {
        self.snapshot.as_ref()
    }

    fn clients(&self) -> &[ClientLocation] {
        self.snapshot
            .as_deref()
            .map(|s| s.clients.as_slice())
            .unwrap_or_default()
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    fn ensure_metrics(&mut self) {
        if !self.metrics_dirty {
            return;
        }
        self.metrics = self
            .snapshot
            .as_deref()
            .ok_or_unavailable("engine", "no snapshot loaded")
            .and_then(|snapshot| compute_journey_metrics(snapshot, &self.range, &self.config));
        self.metrics_dirty = false;
    }

    /// Metrics for the selected agent and date range.
    pub fn metrics(&mut self) -> Result<&JourneyMetrics> {
        self.ensure_metrics();
        self.metrics.as_ref().map_err(|e| e.clone())
    }

    /// Visit report rows for the selected date range.
    pub fn report(&mut self) -> Result<Vec<JourneyReportRow>> {
        Ok(journey_report(&self.metrics()?.visit_records))
    }

    /// Get metrics as JSON string.
    pub fn metrics_json(&mut self) -> String {
        match self.metrics() {
            Ok(metrics) => serde_json::to_string(metrics).unwrap_or_else(|_| "{}".to_string()),
            Err(_) => "{}".to_string(),
        }
    }

    // ========================================================================
    // Markers
    // ========================================================================

    fn ensure_client_markers(&mut self) {
        if !self.client_markers_dirty {
            return;
        }
        self.client_markers = decluster(self.clients(), &self.config.decluster);
        self.client_markers_dirty = false;
    }

    fn ensure_visit_markers(&mut self) {
        if !self.visit_markers_dirty {
            return;
        }
        self.ensure_metrics();
        self.visit_markers = match &self.metrics {
            Ok(metrics) => decluster(&metrics.visit_records, &self.config.decluster),
            Err(_) => Vec::new(),
        };
        self.visit_markers_dirty = false;
    }

    /// Declustered client pins.
    pub fn client_markers(&mut self) -> &[MarkerGroup<ClientLocation>] {
        self.ensure_client_markers();
        &self.client_markers
    }

    /// Declustered visit pins for the selected date range.
    pub fn visit_markers(&mut self) -> &[MarkerGroup<VisitRecord>] {
        self.ensure_visit_markers();
        &self.visit_markers
    }

    // ========================================================================
    // Trends
    // ========================================================================

    fn ensure_trends(&mut self) {
        if !self.trends_dirty {
            return;
        }
        self.trend = monthly_trend(self.clients(), &self.config.trends);
        self.distribution = region_distribution(self.clients(), &self.config.trends);
        self.trends_dirty = false;
    }

    pub fn monthly_trend(&mut self) -> &[TrendBucket] {
        self.ensure_trends();
        &self.trend
    }

    pub fn region_distribution(&mut self) -> &[RegionBucket] {
        self.ensure_trends();
        &self.distribution
    }

    // ========================================================================
    // Spatial Queries
    // ========================================================================

    fn ensure_spatial_index(&mut self) {
        if !self.spatial_dirty {
            return;
        }
        self.client_index = ViewportIndex::new(self.clients().to_vec());
        self.spatial_dirty = false;
    }

    /// Clients inside a viewport, in snapshot order.
    pub fn clients_in_viewport(
        &mut self,
        bounds: &Bounds,
        limit: Option<usize>,
    ) -> Vec<&ClientLocation> {
        self.ensure_spatial_index();
        self.client_index.query(bounds, limit)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&mut self) -> EngineStats {
        self.ensure_client_markers();
        self.ensure_visit_markers();

        let (ping_count, meeting_count, client_count) = self
            .snapshot
            .as_deref()
            .map(|s| (s.pings.len(), s.meetings.len(), s.clients.len()))
            .unwrap_or_default();

        EngineStats {
            generation: self.generation,
            ping_count,
            meeting_count,
            client_count,
            visit_count: self
                .metrics
                .as_ref()
                .map(|m| m.visit_records.len())
                .unwrap_or(0),
            client_marker_groups: self.client_markers.len(),
            visit_marker_groups: self.visit_markers.len(),
        }
    }
}

impl Default for JourneyEngine {
    fn default() -> Self {
        Self::new()
    }
}
