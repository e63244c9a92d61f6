//! rhovoice - live voice assistant core
//!
//! Streams microphone audio to the Gemini Live API, plays the spoken replies
//! back gaplessly, and answers the model's function calls with local tools.

#![forbid(unsafe_code)]

/// Microphone capture through PulseAudio
pub mod capture;
/// Interactive command parsing
pub mod commands;
/// Session and process configuration
pub mod config;
/// PCM frame encoding and decoding
pub mod encoder;
/// Gemini Live wire types
pub mod gemini;
/// Live session transport
pub mod gemini_client;
/// PulseAudio playback engine
pub mod output;
/// Gapless playback scheduling
pub mod playback;
/// PDF to persona generation
pub mod prompt;
/// Session controller
pub mod session;
/// Function-call tools
pub mod tools;
/// Level visualization
pub mod visualizer;
