//! `mcnap` is a transparent TCP front-end that keeps an expensive Minecraft server
//! process stopped while no players are connected, starting it on the first login
//! attempt and bridging traffic once it is reachable.

pub mod backend_control;
pub mod bandwidth;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod handshake;
pub mod response;
