use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)] // Read from `Cargo.toml`
pub struct Config {
    /// tcp port to listen on for peer connections
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// metainfo (.torrent) file
    #[clap(value_parser)]
    pub torrent: String,

    /// directory to download into
    #[clap(value_parser)]
    pub download_dir: String,
}

impl Config {
    pub fn new() -> Config {
        Config::parse()
    }
}
