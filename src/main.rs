mod attach;
mod cgroup;
mod cli;
mod enumerator;
mod error;
mod image;
mod image_store;
mod launcher;
mod manifest;
mod network;
mod overlay;
mod paths;
mod registry;
mod tarball;

use std::process::exit;

use clap::Parser;
use log::error;

use cli::{Opts, SubCommand};
use error::RuntimeResult;
use launcher::ChildModeArgs;

#[tokio::main]
async fn main() {
    env_logger::init();

    let opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    if !nix::unistd::geteuid().is_root() {
        eprintln!("you need root privileges to run this program");
        exit(1);
    }

    if let Err(e) = paths::init_dirs() {
        error!("unable to create runtime directories: {}", e);
        exit(1);
    }

    if let Err(e) = dispatch(opts).await {
        error!("{}", e);
        exit(1);
    }
}

async fn dispatch(opts: Opts) -> RuntimeResult<()> {
    match opts.subcmd {
        SubCommand::Run(r) => {
            launcher::run(r.mem, r.swap, r.pids, r.cpus, &r.image, &r.cmd, &r.args).await
        }
        SubCommand::Exec(e) => attach::exec(&e.container_id, &e.cmd, &e.args).await,
        SubCommand::Images => image::print_available_images(),
        SubCommand::Rmi(r) => image::remove_image(&r.image_hash),
        SubCommand::Ps => enumerator::print_running_containers(),
        SubCommand::SetupNetns(a) => launcher::setup_netns(&a.container_id).await,
        SubCommand::SetupVeth(a) => launcher::setup_veth(&a.container_id).await,
        SubCommand::ChildMode(a) => {
            launcher::child_mode(ChildModeArgs {
                mem: a.mem,
                swap: a.swap,
                pids: a.pids,
                cpus: a.cpus,
                image_hash: a.img,
                container_id: a.container_id,
                cmd: a.cmd,
                args: a.args,
            })
            .await
        }
    }
}
