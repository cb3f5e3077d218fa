//! Command-line surface (§6.1): a single gateway-run mode plus a config-home
//! override, mirroring the narrower operational footprint of a dispatch-only
//! service compared to a general agent CLI.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(about = "Multi-tenant LLM gateway: coalesced, fanned-out, paced streaming dispatch core.")]
pub struct Cli {
    /// Override config directory (same semantics as the YAML system/user merge, §6.4).
    #[arg(long, global = true)]
    pub conf: Option<PathBuf>,

    /// Listen address for the HTTP gateway.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: String,
}
