// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use depthshare::constants::*;
use depthshare::SourceFlags;

#[test]
fn test_player_index_mask() {
    // The mask covers exactly the packed player bits
    assert_eq!(PLAYER_INDEX_MASK, 0b111);
    assert_eq!(PLAYER_INDEX_MASK.count_ones(), PLAYER_INDEX_BITS);
}

#[test]
fn test_backoffs_are_ordered() {
    // Failures back off longer than idle polling
    assert!(DEFAULT_POLL_INTERVAL < DEFAULT_IDLE_SLEEP);
    assert!(DEFAULT_IDLE_SLEEP < DEFAULT_RECONFIGURE_BACKOFF);
    assert!(DEFAULT_RECONFIGURE_BACKOFF < DEFAULT_ERROR_BACKOFF);
    assert!(STOP_CHECK_INTERVAL <= DEFAULT_RECONFIGURE_BACKOFF);
}

#[test]
fn test_source_flag_bits() {
    // Each source owns one distinct bit and ALL is their union
    let union = SourceFlags::ALL
        .iter()
        .fold(SourceFlags::NONE, |acc, flag| acc | flag);
    assert_eq!(union, SourceFlags::ALL);
    for flag in SourceFlags::ALL.iter() {
        assert_eq!(flag.bits().count_ones(), 1);
    }
}

#[test]
fn test_source_flags_parse() {
    let flags: SourceFlags = "color, depth ,color-mapped-depth".parse().unwrap();
    assert_eq!(
        flags,
        SourceFlags::COLOR | SourceFlags::DEPTH | SourceFlags::COLOR_MAPPED_DEPTH
    );
    assert_eq!("none".parse::<SourceFlags>().unwrap(), SourceFlags::NONE);
    assert!("sonar".parse::<SourceFlags>().is_err());
}
