fn main() {
    // A missing .env is fine; real environment variables still apply
    let _ = dotenvy::dotenv();

    // Both reqwest and tokio-tungstenite build rustls clients
    let _ = rustls::crypto::ring::default_provider().install_default();

    klinesync::cli::run();
}
