//! CLI surface, parsed with `clap`'s derive API.
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rockcrate", about = "A minimal Linux container runtime")]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Subcommand)]
pub enum SubCommand {
    /// Launch a new container from an image.
    Run(Run),
    /// Run an additional command inside an already-running container.
    Exec(Exec),
    /// List locally stored images.
    Images,
    /// Remove a locally stored image.
    Rmi(Rmi),
    /// List running containers.
    Ps,

    /// Internal: creates and pins a net namespace for a container. Not for
    /// direct use - invoked by `run` via self re-exec.
    #[command(name = "setup-netns", hide = true)]
    SetupNetns(NetnsArgs),
    /// Internal: moves a veth peer into a container's net namespace and
    /// configures it. Not for direct use.
    #[command(name = "setup-veth", hide = true)]
    SetupVeth(NetnsArgs),
    /// Internal: runs inside the freshly-cloned namespaces and execs the
    /// user command. Not for direct use.
    #[command(name = "child-mode", hide = true)]
    ChildMode(ChildModeArgs),
}

#[derive(clap::Args)]
pub struct Run {
    #[arg(long, default_value_t = -1)]
    pub mem: i64,
    #[arg(long, default_value_t = -1)]
    pub swap: i64,
    #[arg(long, default_value_t = -1)]
    pub pids: i64,
    #[arg(long, default_value_t = -1.0)]
    pub cpus: f64,
    /// Image reference, `name[:tag]`.
    pub image: String,
    /// Command to run inside the container.
    pub cmd: String,
    /// Arguments to the command.
    pub args: Vec<String>,
}

#[derive(clap::Args)]
pub struct Exec {
    pub container_id: String,
    pub cmd: String,
    pub args: Vec<String>,
}

#[derive(clap::Args)]
pub struct Rmi {
    pub image_hash: String,
}

#[derive(clap::Args)]
pub struct NetnsArgs {
    pub container_id: String,
}

#[derive(clap::Args)]
pub struct ChildModeArgs {
    #[arg(long, default_value_t = -1)]
    pub mem: i64,
    #[arg(long, default_value_t = -1)]
    pub swap: i64,
    #[arg(long, default_value_t = -1)]
    pub pids: i64,
    #[arg(long, default_value_t = -1.0)]
    pub cpus: f64,
    #[arg(long)]
    pub img: String,
    pub container_id: String,
    pub cmd: String,
    pub args: Vec<String>,
}
