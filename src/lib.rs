// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Site manager for single Linux VPS hosts.
//!
//! Every site lives in the home directory of a dedicated system user. Sites
//! get applications deployed into them from Git repositories. Node.js
//! applications are run under pm2 behind an nginx reverse proxy, while
//! Laravel applications are served straight from their public directory.
//!
//! The heart of the crate is [`deploy::Deployer`], which reconciles a domain
//! and a repository into a running, supervised application. Each step of
//! that reconciliation lives in its own module:
//!
//! 1. [`path`] resolves a domain into its owning user and directory layout.
//! 2. [`repo`] clones the repository, over SSH with a per-deployment key if
//!    asked to.
//! 3. [`detect`] classifies the checkout.
//! 4. [`database`] provisions a role and a database.
//! 5. [`env`] writes the `.env` file.
//! 6. [`nginx`] points the reverse proxy at the port of the deployment.
//! 7. [`supervisor`] (re)starts the application under pm2.
//!
//! Side effects outside of the file system go through the capabilities in
//! [`system`] and [`prompt`], so that every step can run against fakes.

pub mod config;
pub mod database;
pub mod deploy;
pub mod detect;
pub mod env;
pub mod laravel;
pub mod nginx;
pub mod path;
pub mod prompt;
pub mod repo;
pub mod supervisor;
pub mod system;
