//! Runtime configuration loaded once at startup from the environment (spec §6).
//!
//! Unlike the teacher's `OnceLock<Config>` global, this returns an owned
//! value the bootstrap passes explicitly through `Arc` (spec §9: "global
//! singletons... replaced by explicitly constructed values passed through
//! the bootstrap"). The TLS configuration remains the one permitted
//! once-initialized exception, built separately in `tls.rs`.

mod env {
    pub const DOMAIN: &str = "DOMAIN";
    pub const PORT: &str = "PORT";
    pub const HTTP_PORT: &str = "HTTP_PORT";
    pub const HTTPS_PORT: &str = "HTTPS_PORT";
    pub const TLS_ENABLED: &str = "TLS_ENABLED";
    pub const TLS_REDIRECT: &str = "TLS_REDIRECT";
    pub const CF_API_TOKEN: &str = "CF_API_TOKEN";
    pub const ACME_EMAIL: &str = "ACME_EMAIL";
    pub const ACME_STAGING: &str = "ACME_STAGING";
    pub const KEY_LOC: &str = "KEY_LOC";
    pub const ALLOWED_PORTS: &str = "ALLOWED_PORTS";
    pub const BUFFER_SIZE: &str = "BUFFER_SIZE";
    pub const MODE: &str = "MODE";
    pub const GRPC_ADDRESS: &str = "GRPC_ADDRESS";
    pub const GRPC_PORT: &str = "GRPC_PORT";
    pub const NODE_TOKEN: &str = "NODE_TOKEN";
    pub const PPROF_ENABLED: &str = "PPROF_ENABLED";
    pub const PPROF_PORT: &str = "PPROF_PORT";
    pub const MANAGEMENT_PORT: &str = "MANAGEMENT_PORT";
}

const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Node,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub ssh_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    pub tls_enabled: bool,
    pub tls_redirect: bool,
    pub cf_api_token: Option<String>,
    pub acme_email: Option<String>,
    pub acme_staging: bool,
    pub key_loc: String,
    pub allowed_ports: (u16, u16),
    pub buffer_size: usize,
    pub mode: Mode,
    pub grpc_address: Option<String>,
    pub grpc_port: Option<u16>,
    pub node_token: Option<String>,
    pub pprof_enabled: bool,
    pub pprof_port: u16,
    pub management_port: u16,
}

impl Config {
    /// Reads and validates every key in spec §6's table. Fatal at startup on
    /// any malformed value; the bootstrap logs and exits non-zero.
    pub fn from_env() -> Result<Self, String> {
        let domain = std::env::var(env::DOMAIN).unwrap_or_else(|_| "localhost".to_string());
        let ssh_port = read_port(env::PORT, 2200)?;
        let http_port = read_port(env::HTTP_PORT, 80)?;
        let https_port = read_port(env::HTTPS_PORT, 443)?;
        let tls_enabled = read_bool(env::TLS_ENABLED, false)?;
        let tls_redirect = read_bool(env::TLS_REDIRECT, false)?;
        let cf_api_token = read_opt(env::CF_API_TOKEN);
        let acme_email = read_opt(env::ACME_EMAIL);
        let acme_staging = read_bool(env::ACME_STAGING, false)?;
        let key_loc = std::env::var(env::KEY_LOC).unwrap_or_else(|_| "server_key.pem".to_string());
        let allowed_ports = read_port_range(env::ALLOWED_PORTS, (40000, 40100))?;
        let buffer_size = read_usize(env::BUFFER_SIZE, DEFAULT_BUFFER_SIZE)?;
        let buffer_size = crate::forwarder::clamp_buffer_size(buffer_size);
        let mode = read_mode(env::MODE)?;
        let grpc_address = read_opt(env::GRPC_ADDRESS);
        let grpc_port = read_opt(env::GRPC_PORT)
            .map(|s| s.parse::<u16>().map_err(|_| format!("{} must be a u16", env::GRPC_PORT)))
            .transpose()?;
        let node_token = read_opt(env::NODE_TOKEN);
        let pprof_enabled = read_bool(env::PPROF_ENABLED, false)?;
        let pprof_port = read_port(env::PPROF_PORT, 6060)?;
        let management_port = read_port(env::MANAGEMENT_PORT, 7000)?;

        if tls_enabled && cf_api_token.is_none() {
            return Err(format!("{} is required when TLS_ENABLED=true", env::CF_API_TOKEN));
        }
        if mode == Mode::Node && node_token.is_none() {
            return Err(format!("{} is required in node mode", env::NODE_TOKEN));
        }

        Ok(Self {
            domain,
            ssh_port,
            http_port,
            https_port,
            tls_enabled,
            tls_redirect,
            cf_api_token,
            acme_email,
            acme_staging,
            key_loc,
            allowed_ports,
            buffer_size,
            mode,
            grpc_address,
            grpc_port,
            node_token,
            pprof_enabled,
            pprof_port,
            management_port,
        })
    }
}

fn read_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn read_bool(key: &str, default: bool) -> Result<bool, String> {
    match read_opt(key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(format!("{} must be a boolean, got {:?}", key, v)),
        },
    }
}

fn read_port(key: &str, default: u16) -> Result<u16, String> {
    match read_opt(key) {
        None => Ok(default),
        Some(v) => v.parse::<u16>().map_err(|_| format!("{} must be a valid port, got {:?}", key, v)),
    }
}

fn read_usize(key: &str, default: usize) -> Result<usize, String> {
    match read_opt(key) {
        None => Ok(default),
        Some(v) => v.parse::<usize>().map_err(|_| format!("{} must be a non-negative integer, got {:?}", key, v)),
    }
}

fn read_port_range(key: &str, default: (u16, u16)) -> Result<(u16, u16), String> {
    let Some(v) = read_opt(key) else {
        return Ok(default);
    };
    let (lo, hi) = v
        .split_once('-')
        .ok_or_else(|| format!("{} must be formatted lo-hi, got {:?}", key, v))?;
    let lo: u16 = lo.parse().map_err(|_| format!("{} has an invalid lower bound", key))?;
    let hi: u16 = hi.parse().map_err(|_| format!("{} has an invalid upper bound", key))?;
    if lo > hi {
        return Err(format!("{} lower bound exceeds upper bound", key));
    }
    Ok((lo, hi))
}

fn read_mode(key: &str) -> Result<Mode, String> {
    match read_opt(key).as_deref() {
        None | Some("standalone") => Ok(Mode::Standalone),
        Some("node") => Ok(Mode::Node),
        Some(other) => Err(format!("{} must be 'standalone' or 'node', got {:?}", key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            env::DOMAIN, env::PORT, env::HTTP_PORT, env::HTTPS_PORT, env::TLS_ENABLED,
            env::TLS_REDIRECT, env::CF_API_TOKEN, env::ACME_EMAIL, env::ACME_STAGING,
            env::KEY_LOC, env::ALLOWED_PORTS, env::BUFFER_SIZE, env::MODE, env::GRPC_ADDRESS,
            env::GRPC_PORT, env::NODE_TOKEN, env::PPROF_ENABLED, env::PPROF_PORT,
            env::MANAGEMENT_PORT,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.domain, "localhost");
        assert_eq!(cfg.ssh_port, 2200);
        assert_eq!(cfg.buffer_size, 32 * 1024);
        assert_eq!(cfg.mode, Mode::Standalone);
    }

    #[test]
    fn tls_enabled_requires_cf_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var(env::TLS_ENABLED, "true");
        assert!(Config::from_env().is_err());
        std::env::remove_var(env::TLS_ENABLED);
    }

    #[test]
    fn buffer_size_is_clamped() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var(env::BUFFER_SIZE, "100");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.buffer_size, 4096);
        std::env::remove_var(env::BUFFER_SIZE);
    }

    #[test]
    fn allowed_ports_parses_range() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var(env::ALLOWED_PORTS, "40000-40010");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.allowed_ports, (40000, 40010));
        std::env::remove_var(env::ALLOWED_PORTS);
    }

    #[test]
    fn node_mode_requires_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var(env::MODE, "node");
        assert!(Config::from_env().is_err());
        std::env::remove_var(env::MODE);
    }
}
