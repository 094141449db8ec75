use kestrel_web::{net::bind_reuse, Handled, Handler, Request, Response, Server, StatusCode};

struct HelloWorld;

impl Handler<()> for HelloWorld {
    async fn handle(&self, _: &mut (), _: &Request, resp: &mut Response) -> Handled {
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("Hello, world!")
    }
}

#[tokio::main]
async fn main() {
    // `bind_reuse` sets SO_REUSEADDR/SO_REUSEPORT so a restart doesn't
    // have to wait out the previous socket's TIME_WAIT state.
    let listener = bind_reuse("127.0.0.1:8080".parse().unwrap()).unwrap();

    Server::builder()
        .listener(listener)
        .handler(HelloWorld)
        .build()
        .launch()
        .await;
}
