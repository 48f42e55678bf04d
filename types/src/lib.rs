/*
 * Copyright 2024 Oxide Computer Company
 */

pub mod config;
