use anyhow::Result;
use chrono::Utc;
use reqwest::Client;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tradedesk::config::KiteSettings;
use tradedesk::gateway::{new_local_order, GatewayError, OrderGateway, PlaceOrderParams};
use tradedesk::instruments::{InMemoryCatalog, InstrumentCatalog};
use tradedesk::kite::{KiteGateway, KiteQuotes};
use tradedesk::models::{Direction, OrderStatus, OrderType, ProductType};
use tradedesk::ticker::QuoteProvider;

#[derive(Clone)]
struct StubReply {
    status: &'static str,
    body: String,
}

impl StubReply {
    fn ok(body: serde_json::Value) -> Self {
        Self {
            status: "200 OK",
            body: body.to_string(),
        }
    }

    fn raw(status: &'static str, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

struct KiteStubResponses {
    place: StubReply,
    modify: StubReply,
    cancel: StubReply,
    orders: StubReply,
    quote: StubReply,
    instruments: StubReply,
}

impl Default for KiteStubResponses {
    fn default() -> Self {
        let order_id = serde_json::json!({ "status": "success", "data": { "order_id": "240603000001" } });
        Self {
            place: StubReply::ok(order_id.clone()),
            modify: StubReply::ok(order_id.clone()),
            cancel: StubReply::ok(order_id),
            orders: StubReply::ok(serde_json::json!({ "status": "success", "data": [] })),
            quote: StubReply::ok(serde_json::json!({ "status": "success", "data": {} })),
            instruments: StubReply::raw("200 OK", ""),
        }
    }
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn form_value(&self, key: &str) -> Option<String> {
        self.body.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    }
}

struct KiteStub {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl KiteStub {
    fn start(responses: KiteStubResponses) -> Result<Self> {
        let mut listener: Option<TcpListener> = None;
        for _ in 0..64 {
            let port = fastrand::u16(40_000..60_000);
            if let Ok(bound) = TcpListener::bind(("127.0.0.1", port)) {
                listener = Some(bound);
                break;
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind("127.0.0.1:0")?,
        };
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let base_url = format!("http://{}", addr);
        let (shutdown, shutdown_rx) = mpsc::channel();
        let shared = Arc::new(responses);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = handle_kite_request(stream, &shared, &recorded);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        });

        Ok(Self {
            base_url,
            requests,
            shutdown,
            handle: Some(handle),
        })
    }

    fn gateway(&self) -> KiteGateway {
        let settings = KiteSettings {
            api_key: "kitekey".to_string(),
            access_token: "sessiontoken".to_string(),
            base_url: self.base_url.clone(),
        };
        KiteGateway::new(Client::new(), &settings).unwrap()
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for KiteStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_kite_request(
    mut stream: std::net::TcpStream,
    responses: &KiteStubResponses,
    recorded: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();

    let mut headers = Vec::new();
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let path = target.split('?').next().unwrap_or(&target).to_string();
    if let Ok(mut requests) = recorded.lock() {
        requests.push(RecordedRequest {
            method: method.clone(),
            target: target.clone(),
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        });
    }

    let reply = match (method.as_str(), path.as_str()) {
        ("POST", "/orders/regular") => &responses.place,
        ("PUT", p) if p.starts_with("/orders/regular/") => &responses.modify,
        ("DELETE", p) if p.starts_with("/orders/regular/") => &responses.cancel,
        ("GET", "/orders") => &responses.orders,
        ("GET", "/quote") => &responses.quote,
        ("GET", "/instruments") => &responses.instruments,
        _ => return write_response(&mut stream, "404 Not Found", ""),
    };
    write_response(&mut stream, reply.status, &reply.body)
}

fn write_response(stream: &mut std::net::TcpStream, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn params(order_type: OrderType, direction: Direction) -> PlaceOrderParams {
    PlaceOrderParams {
        symbol: "SBIN".to_string(),
        exchange: "NSE".to_string(),
        is_derivative: false,
        direction,
        product_type: ProductType::Mis,
        order_type,
        qty: 10,
        price: 0.0,
        trigger_price: 0.0,
    }
}

#[tokio::test]
async fn place_order_speaks_kite_vocabulary() {
    let stub = KiteStub::start(KiteStubResponses::default()).unwrap();
    let gateway = stub.gateway();

    let mut stop = params(OrderType::SlMarket, Direction::Short);
    stop.symbol = "NIFTY24JUNFUT".to_string();
    stop.is_derivative = true;
    stop.product_type = ProductType::Nrml;
    stop.trigger_price = 495.0;
    let order = gateway.place_order(&stop).await.unwrap();

    assert_eq!(order.order_id, "240603000001");
    assert_eq!(order.order_status, OrderStatus::Open);
    assert_eq!(order.exchange, "NFO");
    assert_eq!(order.pending_qty, 10);

    let requests = stub.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.target, "/orders/regular");
    assert_eq!(request.header("x-kite-version"), Some("3"));
    assert_eq!(request.header("authorization"), Some("token kitekey:sessiontoken"));
    assert_eq!(request.form_value("tradingsymbol").as_deref(), Some("NIFTY24JUNFUT"));
    assert_eq!(request.form_value("exchange").as_deref(), Some("NFO"));
    assert_eq!(request.form_value("transaction_type").as_deref(), Some("SELL"));
    assert_eq!(request.form_value("order_type").as_deref(), Some("SL-M"));
    assert_eq!(request.form_value("product").as_deref(), Some("NRML"));
    assert_eq!(request.form_value("quantity").as_deref(), Some("10"));
    assert_eq!(request.form_value("trigger_price").as_deref(), Some("495.00"));
    assert_eq!(request.form_value("price"), None);
}

#[tokio::test]
async fn modify_to_market_and_cancel_hit_the_order_resource() {
    let stub = KiteStub::start(KiteStubResponses::default()).unwrap();
    let gateway = stub.gateway();

    let mut limit = params(OrderType::Limit, Direction::Short);
    limit.price = 510.0;
    let order = new_local_order("240603000007".to_string(), &limit, Utc::now());

    let market = gateway.modify_order_to_market(&order).await.unwrap();
    assert_eq!(market.order_type, OrderType::Market);
    let cancelled = gateway.cancel_order(&order).await.unwrap();
    assert_eq!(cancelled.order_status, OrderStatus::Cancelled);
    assert_eq!(cancelled.pending_qty, 0);

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "PUT");
    assert_eq!(requests[0].target, "/orders/regular/240603000007");
    assert_eq!(requests[0].form_value("order_type").as_deref(), Some("MARKET"));
    assert_eq!(requests[0].form_value("price"), None);
    assert_eq!(requests[1].method, "DELETE");
    assert_eq!(requests[1].target, "/orders/regular/240603000007");
}

#[tokio::test]
async fn order_book_statuses_are_normalized() {
    let responses = KiteStubResponses {
        orders: StubReply::ok(serde_json::json!({
            "status": "success",
            "data": [
                {
                    "order_id": "SL1",
                    "status": "TRIGGER PENDING",
                    "order_type": "SL-M",
                    "quantity": 10,
                    "filled_quantity": 0,
                    "pending_quantity": 10,
                    "trigger_price": 495,
                    "average_price": 0
                },
                {
                    "order_id": "E1",
                    "status": "COMPLETE",
                    "order_type": "LIMIT",
                    "quantity": 10,
                    "filled_quantity": 10,
                    "pending_quantity": 0,
                    "price": 500,
                    "average_price": "500.5",
                    "exchange_update_timestamp": "2024-06-03 10:01:02"
                },
                {
                    "order_id": "T1",
                    "status": "CANCELLED AMO",
                    "order_type": "LIMIT",
                    "quantity": 10,
                    "filled_quantity": 4,
                    "pending_quantity": 6,
                    "price": 510,
                    "average_price": 510,
                    "status_message": "Cancelled by user"
                },
                {
                    "order_id": "R1",
                    "status": "REJECTED",
                    "order_type": "LIMIT",
                    "quantity": 10,
                    "filled_quantity": 0,
                    "status_message": "Insufficient funds"
                }
            ]
        })),
        ..KiteStubResponses::default()
    };
    let stub = KiteStub::start(responses).unwrap();
    let gateway = stub.gateway();
    let now = Utc::now();

    let mut sl = new_local_order("SL1".to_string(), &params(OrderType::SlMarket, Direction::Short), now);
    let mut entry = new_local_order("E1".to_string(), &params(OrderType::Limit, Direction::Long), now);
    let mut target = new_local_order("T1".to_string(), &params(OrderType::Limit, Direction::Short), now);
    let mut rejected = new_local_order("R1".to_string(), &params(OrderType::Limit, Direction::Long), now);
    let mut unknown = new_local_order("X9".to_string(), &params(OrderType::Limit, Direction::Long), now);

    let updated = gateway
        .fetch_and_update_all_order_details(&mut [
            &mut sl,
            &mut entry,
            &mut target,
            &mut rejected,
            &mut unknown,
        ])
        .await
        .unwrap();
    assert_eq!(updated, 4);

    assert_eq!(sl.order_status, OrderStatus::Open);
    assert_eq!(sl.trigger_price, 495.0);
    assert_eq!(entry.order_status, OrderStatus::Complete);
    assert_eq!(entry.filled_qty, 10);
    assert_eq!(entry.average_price, 500.5);
    assert_eq!(target.order_status, OrderStatus::Complete);
    assert_eq!(target.filled_qty, 4);
    assert_eq!(target.pending_qty, 0);
    assert_eq!(rejected.order_status, OrderStatus::Rejected);
    assert_eq!(rejected.message.as_deref(), Some("Insufficient funds"));
    assert_eq!(unknown.order_status, OrderStatus::Open);
}

#[tokio::test]
async fn error_envelopes_map_to_gateway_errors() {
    let responses = KiteStubResponses {
        place: StubReply::raw(
            "400 Bad Request",
            r#"{"status":"error","message":"Insufficient funds","error_type":"InputException"}"#,
        ),
        orders: StubReply::raw("503 Service Unavailable", "upstream down"),
        ..KiteStubResponses::default()
    };
    let stub = KiteStub::start(responses).unwrap();
    let gateway = stub.gateway();

    let mut limit = params(OrderType::Limit, Direction::Long);
    limit.price = 500.0;
    match gateway.place_order(&limit).await {
        Err(GatewayError::Rejected { reason, .. }) => {
            assert!(reason.contains("Insufficient funds"), "{}", reason);
            assert!(reason.contains("InputException"), "{}", reason);
        }
        other => panic!("expected a rejection, got {:?}", other),
    }

    let mut order = new_local_order("E1".to_string(), &limit, Utc::now());
    let result = gateway
        .fetch_and_update_all_order_details(&mut [&mut order])
        .await;
    assert!(matches!(result, Err(GatewayError::Transport { .. })));
    assert_eq!(order.order_status, OrderStatus::Open);
}

#[tokio::test]
async fn quotes_resolve_exchange_from_catalog() {
    let responses = KiteStubResponses {
        quote: StubReply::ok(serde_json::json!({
            "status": "success",
            "data": {
                "NSE:SBIN": {
                    "last_price": 503.25,
                    "last_quantity": 5,
                    "average_price": 501.1,
                    "volume": 120000,
                    "ohlc": { "open": 499, "high": 504, "low": 498.5, "close": 500 },
                    "timestamp": "2024-06-03 10:15:00"
                }
            }
        })),
        instruments: StubReply::raw(
            "200 OK",
            "instrument_token,tradingsymbol,lot_size,segment,exchange\n779521,SBIN,1,NSE,NSE\n",
        ),
        ..KiteStubResponses::default()
    };
    let stub = KiteStub::start(responses).unwrap();
    let gateway = Arc::new(stub.gateway());

    let csv = gateway.fetch_instruments_csv().await.unwrap();
    let catalog = InMemoryCatalog::parse_kite_csv(&csv).unwrap();
    assert_eq!(catalog.lookup("SBIN").map(|instrument| instrument.token), Some(779521));

    let quotes = KiteQuotes::new(Arc::clone(&gateway), Arc::new(catalog));
    let tick = quotes.quote("SBIN").await.unwrap().unwrap();
    assert_eq!(tick.symbol, "SBIN");
    assert_eq!(tick.last_price, 503.25);
    assert_eq!(tick.ohlc.close, 500.0);
    assert_eq!(tick.volume, 120000);
    assert_eq!(tick.timestamp.to_rfc3339(), "2024-06-03T04:45:00+00:00");

    let quote_request = stub
        .requests()
        .into_iter()
        .find(|request| request.target.starts_with("/quote"))
        .unwrap();
    assert!(quote_request.target.contains("i=NSE%3ASBIN"), "{}", quote_request.target);
}
