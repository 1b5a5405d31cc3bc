//! CLI surface. Parsed exactly once at startup into an immutable `Options`
//! value; there is no config file and no other environment-variable input
//! besides `RUST_LOG` (consumed directly by `env_logger`, not by this crate).

use structopt::StructOpt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DbgChannelArg {
    Tty,
    Socket,
}

impl std::str::FromStr for DbgChannelArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tty" => Ok(DbgChannelArg::Tty),
            "socket" => Ok(DbgChannelArg::Socket),
            other => Err(format!("unknown channel '{}', expected 'tty' or 'socket'", other)),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(name = "swartd", about = "Host-side debugging bridge for a single-wire device link")]
pub struct Options {
    /// Byte transport to the device: tty (default) or socket.
    #[structopt(short = "c", long = "channel", default_value = "tty")]
    pub channel: DbgChannelArg,

    /// TCP port to use when --channel=socket. Meaningless for tty.
    #[structopt(short = "p", long = "port", default_value = "2000")]
    pub port: u16,

    /// Raise log verbosity; repeatable (-v, -vv, ...).
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    pub verbose: u8,
}

impl Options {
    pub fn from_args_checked() -> Options {
        Options::from_args()
    }
}
