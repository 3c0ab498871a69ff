use std::io;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Ok(path) = std::env::var("MOCK_DAEMON_SOCKET") {
        return serve_socket(path).await;
    }

    let port = std::env::var("PORT").unwrap_or_else(|_| "2375".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    mock_daemon::run(listener).await
}

#[cfg(unix)]
async fn serve_socket(path: String) -> Result<(), io::Error> {
    // A socket left behind by an earlier run would make bind fail.
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)?;
    mock_daemon::run_unix(listener).await
}

#[cfg(not(unix))]
async fn serve_socket(_path: String) -> Result<(), io::Error> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "MOCK_DAEMON_SOCKET needs Unix domain sockets",
    ))
}
