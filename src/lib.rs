//! # Watcher Bridge
//!
//! A Home Assistant add-on that bridges the SenseCAP Watcher device to MQTT
//! and forwards camera snapshots to an LLM backend (a Claude-compatible
//! proxy or a local Ollama instance) for scene description.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────┐  ws://:8000/ws   ┌────────────────────┐   MQTT    ┌──────────────┐
//!  │ Watcher  │◀───────────────▶│       bridge       │◀─────────▶│ Home         │
//!  │ device   │  http://:8001   │  (this add-on)     │ discovery │ Assistant    │
//!  └──────────┘  /ota /vision   └─────┬────────┬─────┘           └──────────────┘
//!                                     │        │
//!                              HTTPS  ▼        ▼  wss
//!                          ┌────────────┐  ┌────────────┐
//!                          │ Claude /   │  │ SenseCraft │
//!                          │ Ollama     │  │ MCP broker │
//!                          └────────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Add-on options and MQTT credential resolution |
//! | [`supervisor`] | Supervisor service discovery API |
//! | [`entities`] | MQTT Discovery payloads and topic scheme |
//! | [`mqtt`] | Broker session and command routing |
//! | [`device`] | Device protocol model and connection handle |
//! | [`ws_server`] | Device WebSocket endpoint |
//! | [`ota`] | OTA check-in and vision HTTP endpoints |
//! | [`llm`] | LLM provider abstraction (Claude, Ollama) |
//! | [`speech`] | Yandex SpeechKit STT/TTS |
//! | [`monitoring`] | Motion/noise detection and scene analysis |
//! | [`display`] | Device screen control |
//! | [`mcp`] | SenseCraft MCP bridge |
//! | [`ha_api`] | Home Assistant core REST API client and tools |
//! | [`bridge`] | Orchestrator |

pub mod bridge;
pub mod config;
pub mod device;
pub mod display;
pub mod entities;
pub mod ha_api;
pub mod llm;
pub mod mcp;
pub mod monitoring;
pub mod mqtt;
pub mod ota;
pub mod speech;
pub mod supervisor;
pub mod ws_server;
