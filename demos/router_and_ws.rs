use kestrel_web::{
    arena::Arena,
    router::{Context, Middleware, Router, RouterBuilder},
    ws::{upgrade::try_upgrade, Message, WebSocketConnection},
    Handled, Request, Response, Server, StatusCode,
};
use std::{future::Future, pin::Pin};
use tokio::net::{TcpListener, TcpStream};

/// Logs every request after the rest of the chain has run.
struct Logger;

impl Middleware for Logger {
    fn call<'ctx, 'd>(
        &'ctx self,
        ctx: &'ctx mut Context<'d, ()>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
        Box::pin(async move {
            ctx.next().await;
            println!("{:?} {:?}", ctx.request.method(), ctx.request.url().path());
        })
    }
}

struct Greet;

impl Middleware for Greet {
    fn call<'ctx, 'd>(
        &'ctx self,
        ctx: &'ctx mut Context<'d, ()>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
        Box::pin(async move {
            let name = ctx.param(b"name").unwrap_or(b"world");
            ctx.response
                .status(StatusCode::Ok)
                .header("content-type", "text/plain")
                .body(format!("Hello, {}!", String::from_utf8_lossy(name)));
        })
    }
}

/// Upgrades `/echo` to a WebSocket and echoes back every text message
/// received until the peer closes the connection.
struct Echo;

impl Middleware for Echo {
    fn call<'ctx, 'd>(
        &'ctx self,
        ctx: &'ctx mut Context<'d, ()>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
        Box::pin(async move {
            match try_upgrade(ctx.request, ctx.response) {
                Ok(handled) => {
                    let _: Handled = handled;
                }
                Err(e) => {
                    ctx.response.status(StatusCode::BadRequest).body(e.to_string());
                }
            }
        })
    }

    fn call_ws<'ctx>(
        &'ctx self,
        _connection_data: &'ctx mut (),
        _request: &'ctx Request,
        stream: &'ctx mut TcpStream,
        buffer: &'ctx mut [u8],
        arena: &'ctx Arena,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'ctx>> {
        Box::pin(async move {
            let mut ws = WebSocketConnection::new(stream, buffer, Default::default(), arena);

            loop {
                match ws.read_message().await {
                    Ok(Message::Text(text)) => {
                        if ws.send_text(&text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if ws.send_binary(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close { .. }) | Err(_) => break,
                }
            }
        })
    }
}

#[tokio::main]
async fn main() {
    let router: Router = RouterBuilder::new()
        .middleware(Logger)
        .route(kestrel_web::Method::Get, "/hello/:name", Greet)
        .route(kestrel_web::Method::Get, "/echo", Echo)
        .build();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(router)
        .build()
        .launch()
        .await;
}
