/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

pub const TCP_STATE_UNKNOWN: &str = "UNKNOWN";

const TCP_STATE_NAMES: [&str; 11] = [
    "CLOSED",
    "LISTEN",
    "SYN_SENT",
    "SYN_RECEIVED",
    "ESTABLISHED",
    "FIN_WAIT_1",
    "FIN_WAIT_2",
    "CLOSE_WAIT",
    "CLOSING",
    "LAST_ACK",
    "TIME_WAIT",
];

/// Returns the name of a TCP state code, or `UNKNOWN` for codes outside 0..=10.
pub fn name_for(code: u8) -> &'static str {
    TCP_STATE_NAMES
        .get(code as usize)
        .copied()
        .unwrap_or(TCP_STATE_UNKNOWN)
}
