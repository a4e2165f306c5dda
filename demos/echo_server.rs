use log::*;

use websocket_engine::config::ServerConfigBuilder;
use websocket_engine::server::Server;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfigBuilder::new(9002, ())
        .host("127.0.0.1")
        .on_open(|_server, handle| {
            info!("{} connected", handle);
        })
        .on_message(|server, handle, bytes, kind| {
            let server = server.clone();
            let payload = bytes.to_vec();
            tokio::spawn(async move {
                if let Err(err) = server.send_frame(handle, kind, &payload).await {
                    error!("{} failed to echo frame: {}", handle, err);
                }
            });
        })
        .on_close(|_server, handle| {
            info!("{} disconnected", handle);
        })
        .build();

    info!("listening on 127.0.0.1:9002");
    if let Err(err) = Server::new(config).serve().await {
        error!("server stopped: {}", err);
    }
}
