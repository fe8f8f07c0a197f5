use hydra::{HydraCellConfig, HydraOptions, MemberInfo, ReplicaId};
use slog::Drain;
use std::error::Error;
use std::net::Ipv4Addr;
use std::path::PathBuf;

const USAGE: &str = "usage: hydra <my-replica-id> <data-directory> <replica-id>=<ipv4>:<port>...";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let my_replica_id = args.next().ok_or(USAGE)?;
    let data_directory = PathBuf::from(args.next().ok_or(USAGE)?);
    let cluster_members = args.map(|arg| parse_member(&arg)).collect::<Result<Vec<_>, _>>()?;
    if cluster_members.is_empty() {
        return Err(USAGE.into());
    }

    let logger = create_root_logger_for_stdout(my_replica_id.clone());
    let cell = hydra::try_create_hydra_cell(HydraCellConfig {
        my_replica_id,
        cluster_members,
        data_directory,
        logger: logger.clone(),
        options: HydraOptions::default(),
    })
    .await?;

    let mut status = cell.status_listener();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = status.next() => match next {
                Some(s) => slog::info!(logger, "Replica status changed"; "State" => ?s.state, "Term" => ?s.term),
                None => break,
            },
        }
    }

    slog::info!(logger, "Shutting down");
    cell.shutdown().await;
    Ok(())
}

fn parse_member(arg: &str) -> Result<MemberInfo, String> {
    let malformed = || format!("Malformed member '{}'. {}", arg, USAGE);
    let (replica_id, address) = split_once(arg, '=').ok_or_else(malformed)?;
    let (ip, port) = split_once(address, ':').ok_or_else(malformed)?;

    Ok(MemberInfo {
        replica_id: ReplicaId::new(replica_id),
        ip: ip.parse::<Ipv4Addr>().map_err(|_| malformed())?,
        port: port.parse::<u16>().map_err(|_| malformed())?,
    })
}

fn split_once(s: &str, delimiter: char) -> Option<(&str, &str)> {
    let i = s.find(delimiter)?;
    Some((&s[..i], &s[i + 1..]))
}

fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}
