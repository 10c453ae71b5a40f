// Copyright 2024 The RegionServer Authors. Licensed under Apache-2.0.

mod merge;
mod scanner_lease;
mod split;
mod write_read;
