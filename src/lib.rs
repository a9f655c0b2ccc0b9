#![forbid(unsafe_code)]

//! Background job engine that downloads videos with yt-dlp and files them
//! into a Radarr movie library.

pub mod config;
pub mod extras;
pub mod jobs;
pub mod logging;
pub mod naming;
pub mod orchestrator;
pub mod paths;
pub mod playlist;
pub mod radarr;
pub mod request;
pub mod security;
pub mod ytdlp;
