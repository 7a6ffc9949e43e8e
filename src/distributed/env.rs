//! Rank and world-size discovery from launcher environment variables
//!
//! Two launcher conventions are recognised:
//!
//! - `WORLD_SIZE` / `RANK` / `LOCAL_RANK` (torchrun-style `env://` launch)
//! - `OMPI_COMM_WORLD_SIZE` / `OMPI_COMM_WORLD_RANK` / `OMPI_COMM_WORLD_LOCAL_RANK`
//!   (processes started by `mpirun`, as ring-allreduce launchers do)
//!
//! Distributed mode is active iff the discovered world size is greater than 1.

use candle_core::Result;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Where this process sits in the job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl Default for DistEnv {
    fn default() -> Self {
        Self::single(0)
    }
}

impl DistEnv {
    /// Non-distributed environment for a single process
    pub fn single(local_rank: usize) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    /// Read the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the environment through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&'static str]| keys.iter().find_map(|k| lookup(k).map(|v| (*k, v)));

        let world_size = match first(&["WORLD_SIZE", "OMPI_COMM_WORLD_SIZE"]) {
            Some((key, value)) => parse_var(key, &value)?,
            None => 1,
        };
        let rank = match first(&["RANK", "OMPI_COMM_WORLD_RANK"]) {
            Some((key, value)) => parse_var(key, &value)?,
            None => 0,
        };
        let local_rank = match first(&["LOCAL_RANK", "OMPI_COMM_WORLD_LOCAL_RANK"]) {
            Some((key, value)) => parse_var(key, &value)?,
            None => rank,
        };
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = match lookup("MASTER_PORT") {
            Some(value) => parse_var("MASTER_PORT", &value)?,
            None => DEFAULT_MASTER_PORT,
        };

        if world_size == 0 {
            return Err(candle_core::Error::Msg("WORLD_SIZE must be at least 1".to_string()));
        }
        if rank >= world_size {
            return Err(candle_core::Error::Msg(format!(
                "RANK {} is out of range for WORLD_SIZE {}",
                rank, world_size
            )));
        }

        Ok(Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        })
    }

    /// Replace the local rank when an explicit override is given on the command line.
    /// The environment wins, as with launcher-provided `LOCAL_RANK`.
    pub fn with_local_rank_fallback(mut self, cli_local_rank: usize, env_has_local_rank: bool) -> Self {
        if !env_has_local_rank {
            self.local_rank = cli_local_rank;
        }
        self
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn master_endpoint(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        candle_core::Error::Msg(format!("Invalid value for {}: {:?}", key, value))
    })
}

/// Whether the launcher provided a local rank for this process
pub fn env_has_local_rank() -> bool {
    std::env::var_os("LOCAL_RANK").is_some() || std::env::var_os("OMPI_COMM_WORLD_LOCAL_RANK").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_is_single_process() {
        let env = DistEnv::from_lookup(lookup(&[])).unwrap();
        assert_eq!(env, DistEnv::single(0));
        assert!(!env.is_distributed());
    }

    #[test]
    fn test_torchrun_variables() {
        let env = DistEnv::from_lookup(lookup(&[
            ("WORLD_SIZE", "4"),
            ("RANK", "3"),
            ("LOCAL_RANK", "1"),
            ("MASTER_ADDR", "10.0.0.2"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap();
        assert_eq!(env.rank, 3);
        assert_eq!(env.world_size, 4);
        assert_eq!(env.local_rank, 1);
        assert_eq!(env.master_endpoint(), "10.0.0.2:1234");
        assert!(env.is_distributed());
    }

    #[test]
    fn test_mpi_variables_and_local_rank_default() {
        let env = DistEnv::from_lookup(lookup(&[
            ("OMPI_COMM_WORLD_SIZE", "2"),
            ("OMPI_COMM_WORLD_RANK", "1"),
        ]))
        .unwrap();
        assert_eq!(env.world_size, 2);
        assert_eq!(env.rank, 1);
        assert_eq!(env.local_rank, 1);
    }

    #[test]
    fn test_world_size_one_is_not_distributed() {
        let env = DistEnv::from_lookup(lookup(&[("WORLD_SIZE", "1")])).unwrap();
        assert!(!env.is_distributed());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(DistEnv::from_lookup(lookup(&[("WORLD_SIZE", "two")])).is_err());
        assert!(DistEnv::from_lookup(lookup(&[("WORLD_SIZE", "2"), ("RANK", "2")])).is_err());
        assert!(DistEnv::from_lookup(lookup(&[("WORLD_SIZE", "0")])).is_err());
    }

    #[test]
    fn test_cli_local_rank_only_applies_without_env() {
        let env = DistEnv::single(0).with_local_rank_fallback(2, false);
        assert_eq!(env.local_rank, 2);
        let env = DistEnv::single(1).with_local_rank_fallback(2, true);
        assert_eq!(env.local_rank, 1);
    }
}
