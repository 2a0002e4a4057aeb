// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod config;
pub mod copying;
pub mod monitors;
pub mod tailer;
pub mod uploader;
