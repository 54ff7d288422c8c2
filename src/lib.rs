// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod relay;

pub mod channel;
pub mod config;
pub mod errors;
pub mod topology;
pub mod worker;
