use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone)]
#[command(name = "codeduel_lobby", version, about = "Lobby and round server for coding duels", long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "0.0.0.0:5010")]
    pub host: SocketAddr,

    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:5000")]
    pub backend_url: String,

    #[arg(long, env = "BACKEND_API_KEY", default_value = "xxx")]
    pub backend_api_key: String,

    #[arg(long, env = "RUNNER_URL", default_value = "http://localhost:5020")]
    pub runner_url: String,

    #[arg(long, env = "RUNNER_API_KEY", default_value = "xxx")]
    pub runner_api_key: String,

    /// Validate tokens locally with this HS256 secret instead of asking the backend
    #[arg(long, env = "JWT_SECRET")]
    pub jwt_secret: Option<String>,

    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:5173")]
    pub cors_origin: String,

    /// Serve built-in challenges and keep match results in memory
    #[arg(long, env = "OFFLINE", default_value_t = false)]
    pub offline: bool,

    /// Largest websocket message accepted from a player, in bytes
    #[arg(long, env = "MAX_MESSAGE_SIZE", default_value_t = 64 * 1024)]
    pub max_message_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["codeduel_lobby"]);
        assert_eq!(args.host.port(), 5010);
        assert_eq!(args.max_message_size, 65536);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "codeduel_lobby",
            "--host",
            "127.0.0.1:9000",
            "--jwt-secret",
            "s3cret",
            "--offline",
        ]);
        assert_eq!(args.host, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(args.jwt_secret.as_deref(), Some("s3cret"));
        assert!(args.offline);
    }
}
