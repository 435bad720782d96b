//! Shard-node server executable.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;

use oramshard::{
    endpoint_addr, pf_error, ClusterConfig, LocalLog, OramShardError,
    ReplicaId, ShardNodeReplica, StorageId,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica ID of myself.
    #[arg(short, long)]
    id: ReplicaId,

    /// Router-facing API port.
    #[arg(short, long, default_value_t = 8748)]
    api_port: u16,

    /// ORAM node addresses, the order of which maps to storage shard IDs.
    /// Example: '-o host1:port1 -o host2:port2'. Overrides the cluster
    /// file's oram_nodes table when given.
    #[arg(short, long)]
    orams: Vec<SocketAddr>,

    /// Path to the cluster description TOML file.
    #[arg(short, long)]
    cluster: Option<String>,

    /// Node configuration string in TOML format.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the storage shard ->
    /// ORAM node address map on success.
    fn sanitize(&self) -> Result<HashMap<StorageId, SocketAddr>, OramShardError> {
        if self.api_port <= 1024 {
            return Err(OramShardError(format!(
                "invalid api_port {}",
                self.api_port
            )));
        }
        if self.threads < 2 {
            return Err(OramShardError(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let mut oram_addrs = HashMap::new();
        if !self.orams.is_empty() {
            for (sid, &addr) in self.orams.iter().enumerate() {
                oram_addrs.insert(sid as StorageId, addr);
            }
        } else if let Some(ref cluster_path) = self.cluster {
            let cluster = ClusterConfig::from_file(Path::new(cluster_path))?;
            for endpoint in &cluster.oram_nodes {
                oram_addrs.insert(
                    endpoint.id,
                    endpoint_addr(&endpoint.ip, endpoint.port)?,
                );
            }
        }
        if oram_addrs.is_empty() {
            return Err(OramShardError(
                "no oram nodes given through --orams or --cluster".into(),
            ));
        }

        Ok(oram_addrs)
    }
}

// Shard-node executable main entrance.
fn shardnode_main() -> Result<(), OramShardError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let oram_addrs = args.sanitize()?;

    // parse router-facing API port
    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port)
        .parse()
        .map_err(|e| {
            OramShardError(format!(
                "failed to parse api_addr: port {}: {}",
                args.api_port, e
            ))
        })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-replica{}", args.id))
        .build()?;

    // enter tokio runtime, set up the replica, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut node = ShardNodeReplica::new_and_setup(
            args.id,
            api_addr,
            oram_addrs,
            Box::new(LocalLog::new(10000)),
            args.config.as_deref(),
        )
        .await?;

        node.run().await;

        Ok::<(), OramShardError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = shardnode_main() {
        pf_error!("shardnode"; "shardnode_main exitted: {}", e);
    }
}

#[cfg(test)]
mod shardnode_args_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            id: 0,
            api_port: 8748,
            orams: vec!["127.0.0.1:8751".parse().unwrap()],
            cluster: None,
            config: None,
            threads: 4,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), OramShardError> {
        let oram_addrs = valid_args().sanitize()?;
        assert_eq!(oram_addrs.len(), 1);
        assert_eq!(oram_addrs[&0], "127.0.0.1:8751".parse().unwrap());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_api_port() {
        let mut args = valid_args();
        args.api_port = 1023;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_no_orams() {
        let mut args = valid_args();
        args.orams = vec![];
        assert!(args.sanitize().is_err());
    }
}
