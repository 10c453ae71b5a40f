// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

lazy_static! {
    pub static ref REGION_COUNT_GAUGE_VEC: IntGaugeVec = register_int_gauge_vec!(
        "regionserver_region_count",
        "Number of regions tracked by state",
        &["state"]
    )
    .unwrap();
    pub static ref WAL_APPEND_DURATION_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "regionserver_wal_append_duration_seconds",
        "Bucketed histogram of WAL append latency",
        &["result"]
    )
    .unwrap();
    pub static ref FLUSH_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "regionserver_flush_total",
        "Total number of region flushes by result",
        &["result"]
    )
    .unwrap();
    pub static ref FLUSH_DURATION_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "regionserver_flush_duration_seconds",
        "Bucketed histogram of flush latency",
        &["result"]
    )
    .unwrap();
    pub static ref COMPACTION_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "regionserver_compaction_total",
        "Total number of store compactions by result",
        &["result"]
    )
    .unwrap();
    pub static ref SPLIT_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "regionserver_split_total",
        "Total number of region splits by result",
        &["result"]
    )
    .unwrap();
    pub static ref HEARTBEAT_DURATION_HISTOGRAM: HistogramVec = register_histogram_vec!(
        "regionserver_heartbeat_duration_seconds",
        "Bucketed histogram of master heartbeat round-trip latency",
        &["result"]
    )
    .unwrap();
    pub static ref SCANNER_LEASE_EXPIRED_COUNTER: IntCounterVec = register_int_counter_vec!(
        "regionserver_scanner_lease_expired_total",
        "Total number of scanner leases that expired without renewal",
        &["reason"]
    )
    .unwrap();
    pub static ref MERGE_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "regionserver_merge_total",
        "Total number of successful catalog region merges",
        &["mode"]
    )
    .unwrap();
}
