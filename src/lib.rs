//! Localgate - Local Hardware Gateway Library
//!
//! Web pages reach local printers, serial ports, USB/HID devices and the
//! filesystem through a WebSocket served by this daemon. This library holds
//! the two halves that make that safe:
//!
//! - **Trust establishment**: a per-install root CA and a transport
//!   certificate it signs, persisted as PKCS#12 keystores described by a
//!   `.properties` manifest, installed into the OS and browser trust stores.
//! - **Request authorization**: caller identity certificates, request
//!   signatures, persistent allow/block lists and a human consent prompt that
//!   is never shown twice at once.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, 20 years)
//!   └── Transport certificate (SAN = configured hosts, 825 days)
//!
//! page ──wss──▶ webserver ──▶ request_authorizer ──▶ device_backend
//!                  │               │
//!                  │               ├── decision_store (allowed.dat / blocked.dat)
//!                  │               └── consent_prompt (one at a time)
//!                  └── connection_registry (closes device handles on disconnect)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use localgate::certificate_manager::{CertificateManager, StorageLocations};
//! use localgate::native_installer::{self, PrivilegeLevel, StoreIdentity};
//! use localgate::platform::Platform;
//! use localgate::shell::SystemRunner;
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let platform = Platform::current();
//!     let hosts = vec!["localhost".to_string()];
//!     let mut manager =
//!         CertificateManager::load_or_create(StorageLocations::for_platform(platform, None), &hosts, false)?;
//!
//!     let runner = Arc::new(SystemRunner);
//!     let privilege = PrivilegeLevel::detect(platform, runner.as_ref());
//!     let identity = StoreIdentity::from_certificate_identity(manager.identity());
//!     let store = native_installer::for_platform(platform, privilege, identity, runner);
//!     let root = manager.root_certificate_file()?;
//!     native_installer::ensure_trusted(store.as_ref(), &root, manager.needs_install());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`certificate_chain_builder`], [`generate_root_ca`], [`generate_transport_cert`]: certificate generation
//! - [`certificate_manager`], [`key_material`], [`trust_manifest`], [`tls_context`]: persistence and live TLS
//! - [`native_installer`], [`browser_trust`]: trust store installation
//! - [`identity`], [`request_authorizer`], [`decision_store`], [`consent_prompt`]: authorization
//! - [`protocol`], [`webserver`], [`connection_registry`], [`device_backend`]: transport

pub mod browser_trust;
pub mod certificate_chain_builder;
pub mod certificate_manager;
pub mod configs;
pub mod connection_registry;
pub mod consent_prompt;
pub mod decision_store;
pub mod device_backend;
pub mod generate_root_ca;
pub mod generate_transport_cert;
pub mod identity;
pub mod key_material;
pub mod native_installer;
pub mod platform;
pub mod protocol;
pub mod request_authorizer;
pub mod shell;
pub mod tls_context;
pub mod trust_manifest;
pub mod webserver;
