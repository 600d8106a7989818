//! Kitchen ticket and bill printing.
//!
//! Documents are rendered to ESC/POS bytes and delivered best-effort,
//! either raw over TCP to a network printer or as a spool file that the
//! device's print intent picks up. Every attempt lands in `print_log`;
//! a failed print never fails the order flow that triggered it.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::catalog::{self, Product, Station};
use crate::db::{self, DbState};
use crate::escpos::{EscPosBuilder, PaperWidth};
use crate::pedido::{format_brl, Order, OrderItem};
use crate::settings::Settings;
use crate::tables::Table;

pub const DEFAULT_PRINTER_PORT: u16 = 9100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrintChannel {
    Network { host: String, port: u16 },
    DeviceIntent,
}

impl PrintChannel {
    /// `host` or `host:port`; a missing address means the device prints.
    pub fn from_address(address: Option<&str>) -> Self {
        let Some(address) = address.map(str::trim).filter(|a| !a.is_empty()) else {
            return Self::DeviceIntent;
        };
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
                Ok(port) => Self::Network {
                    host: host.to_string(),
                    port,
                },
                Err(_) => Self::Network {
                    host: address.to_string(),
                    port: DEFAULT_PRINTER_PORT,
                },
            },
            _ => Self::Network {
                host: address.to_string(),
                port: DEFAULT_PRINTER_PORT,
            },
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::from_address(settings.printer_address.as_deref())
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::DeviceIntent => "device",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintKind {
    KitchenTicket,
    Bill,
}

impl PrintKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KitchenTicket => "kitchen_ticket",
            Self::Bill => "bill",
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn format_percent(percent: f64) -> String {
    if percent.fract() == 0.0 {
        format!("{percent:.0}%")
    } else {
        format!("{percent:.1}%").replace('.', ",")
    }
}

fn station_for(products: &[Product], item: &OrderItem) -> Station {
    catalog::find_by_name(products, &item.name)
        .map(|p| p.station)
        .unwrap_or(Station::Kitchen)
}

/// Kitchen ticket for one order. Items are grouped under a header per
/// preparation station so the bar and the kitchen can tear their part off.
pub fn render_kitchen_ticket(
    order: &Order,
    products: &[Product],
    paper: PaperWidth,
    printed_at: DateTime<Local>,
) -> Vec<u8> {
    let mut b = EscPosBuilder::new().with_paper(paper);
    b.init()
        .portuguese()
        .center()
        .bold(true)
        .double_height()
        .text(&format!("MESA {}\n", order.table))
        .normal_size()
        .bold(false)
        .text(&format!("Pedido #{}\n", order.id))
        .text(&format!("{}\n", printed_at.format("%d/%m/%Y %H:%M")))
        .left()
        .separator();

    for station in [Station::Kitchen, Station::Bar] {
        let items: Vec<&OrderItem> = order
            .items
            .iter()
            .filter(|item| station_for(products, item) == station)
            .collect();
        if items.is_empty() {
            continue;
        }
        b.bold(true).text(&format!("[{}]\n", station.label())).bold(false);
        for item in items {
            b.text(&format!("{}x {}\n", item.quantity, item.name));
        }
    }

    if let Some(note) = order.note.as_deref() {
        b.separator().bold(true).text("OBS: ").bold(false).text(note).lf();
    }
    b.feed(3).cut();
    b.build()
}

/// Bill for a table: its consumption, subtotal, service fee and total.
pub fn render_bill(
    table: &Table,
    settings: &Settings,
    paper: PaperWidth,
    printed_at: DateTime<Local>,
) -> Vec<u8> {
    let subtotal = table.consumption_total();
    let fee = settings.service_fee(subtotal);

    let mut b = EscPosBuilder::new().with_paper(paper);
    b.init().portuguese().center().bold(true);
    if !settings.restaurant_name.trim().is_empty() {
        b.text(&format!("{}\n", settings.restaurant_name));
    }
    b.text(&format!("CONTA - MESA {}\n", table.id))
        .bold(false)
        .text(&format!("{}\n", printed_at.format("%d/%m/%Y %H:%M")))
        .left()
        .separator();

    for item in &table.consumption {
        b.line_pair(
            &format!("{}x {}", item.quantity, item.name),
            &format_brl(item.line_total()),
        );
    }

    b.separator().line_pair("Subtotal", &format_brl(subtotal));
    if fee > 0.0 {
        b.line_pair(
            &format!("Taxa de serviço ({})", format_percent(settings.service_fee_percent)),
            &format_brl(fee),
        );
    }
    b.bold(true)
        .line_pair("TOTAL", &format_brl(subtotal + fee))
        .bold(false)
        .feed(3)
        .cut();
    b.build()
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

async fn send_network(host: &str, port: u16, bytes: &[u8]) -> Result<String, String> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| format!("TCP connect to {host}:{port} timed out"))?
        .map_err(|e| format!("TCP connect to {host}:{port} failed: {e}"))?;

    tokio::time::timeout(WRITE_TIMEOUT, async {
        stream.write_all(bytes).await?;
        stream.flush().await?;
        stream.shutdown().await
    })
    .await
    .map_err(|_| format!("Write to {host}:{port} timed out"))?
    .map_err(|e| format!("Write to {host}:{port} failed: {e}"))?;

    Ok(format!("{host}:{port}"))
}

async fn write_spool_file(spool_dir: &Path, reference: &str, bytes: &[u8]) -> Result<String, String> {
    tokio::fs::create_dir_all(spool_dir)
        .await
        .map_err(|e| format!("Failed to create spool dir: {e}"))?;
    let file_name = format!(
        "{}-{}.bin",
        reference.replace(':', "-"),
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f")
    );
    let path = spool_dir.join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| format!("Failed to write spool file: {e}"))?;
    Ok(path.display().to_string())
}

/// Deliver a rendered document and record the attempt.
pub async fn deliver(
    db: &DbState,
    channel: &PrintChannel,
    spool_dir: &Path,
    kind: PrintKind,
    reference: &str,
    bytes: &[u8],
) -> Result<String, String> {
    let result = match channel {
        PrintChannel::Network { host, port } => send_network(host, *port, bytes).await,
        PrintChannel::DeviceIntent => write_spool_file(spool_dir, reference, bytes).await,
    };

    match &result {
        Ok(target) => info!(kind = kind.as_str(), reference, target = %target, "print delivered"),
        Err(e) => warn!(kind = kind.as_str(), reference, error = %e, "print failed"),
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::record_print_attempt(
        &conn,
        kind.as_str(),
        reference,
        channel.label(),
        result.as_ref().err().map(String::as_str),
    )?;
    result
}

/// Fire-and-forget delivery on the runtime. Failures are only logged.
pub fn spawn_delivery(
    db: Arc<DbState>,
    channel: PrintChannel,
    spool_dir: PathBuf,
    kind: PrintKind,
    reference: String,
    bytes: Vec<u8>,
) {
    tokio::spawn(async move {
        let _ = deliver(&db, &channel, &spool_dir, kind, &reference, &bytes).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pedido::OrderStatus;
    use crate::tables::TableStatus;
    use chrono::TimeZone;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, 20, 30, 0).unwrap()
    }

    fn item(name: &str, price: f64, quantity: u32) -> OrderItem {
        OrderItem {
            name: name.into(),
            price,
            quantity,
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_channel_from_address() {
        assert_eq!(PrintChannel::from_address(None), PrintChannel::DeviceIntent);
        assert_eq!(PrintChannel::from_address(Some("  ")), PrintChannel::DeviceIntent);
        assert_eq!(
            PrintChannel::from_address(Some("192.168.0.50")),
            PrintChannel::Network {
                host: "192.168.0.50".into(),
                port: DEFAULT_PRINTER_PORT
            }
        );
        assert_eq!(
            PrintChannel::from_address(Some("cozinha.local:9101")),
            PrintChannel::Network {
                host: "cozinha.local".into(),
                port: 9101
            }
        );
    }

    #[test]
    fn test_kitchen_ticket_groups_by_station() {
        let products = catalog::parse_products(&[
            serde_json::json!({ "id": 1, "nome": "Chopp", "setor": "bar" }),
            serde_json::json!({ "id": 2, "nome": "Pastel", "setor": "cozinha" }),
        ]);
        let order = Order {
            id: 42,
            table: 7,
            items: vec![item("Chopp", 9.0, 2), item("Pastel", 8.0, 1)],
            status: OrderStatus::Pending,
            note: Some("sem cebola".into()),
            created_at: None,
            quantity: 3,
            total: 26.0,
        };
        let bytes = render_kitchen_ticket(&order, &products, PaperWidth::Mm80, at());
        assert!(contains(&bytes, b"MESA 7"));
        assert!(contains(&bytes, b"Pedido #42"));
        assert!(contains(&bytes, b"[COZINHA]"));
        assert!(contains(&bytes, b"[BAR]"));
        assert!(contains(&bytes, b"2x Chopp"));
        assert!(contains(&bytes, b"sem cebola"));
        let kitchen = bytes.windows(9).position(|w| w == b"[COZINHA]").unwrap();
        let bar = bytes.windows(5).position(|w| w == b"[BAR]").unwrap();
        assert!(kitchen < bar);
    }

    #[test]
    fn test_bill_includes_service_fee() {
        let table = Table {
            id: 3,
            status: TableStatus::Occupied,
            alert: crate::tables::TableAlert::BillRequested,
            consumption: vec![item("Pastel", 8.0, 2), item("Suco", 7.0, 2)],
        };
        let settings = Settings {
            restaurant_name: "Bar do Zé".into(),
            ..Settings::default()
        };
        let bytes = render_bill(&table, &settings, PaperWidth::Mm80, at());
        assert!(contains(&bytes, b"CONTA - MESA 3"));
        assert!(contains(&bytes, b"R$ 30,00"));
        assert!(contains(&bytes, b"(10%)"));
        assert!(contains(&bytes, b"R$ 3,00"));
        assert!(contains(&bytes, b"R$ 33,00"));
    }

    #[test]
    fn test_bill_without_fee_skips_fee_line() {
        let table = Table {
            id: 1,
            status: TableStatus::Occupied,
            alert: crate::tables::TableAlert::None,
            consumption: vec![item("Suco", 7.0, 1)],
        };
        let settings = Settings {
            service_fee_percent: 0.0,
            ..Settings::default()
        };
        let bytes = render_bill(&table, &settings, PaperWidth::Mm58, at());
        assert!(!contains(&bytes, b"Taxa"));
        assert!(contains(&bytes, b"R$ 7,00"));
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(10.0), "10%");
        assert_eq!(format_percent(12.5), "12,5%");
    }

    #[tokio::test]
    async fn test_network_delivery_sends_raw_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let db = db::test_state();
        let channel = PrintChannel::Network {
            host: "127.0.0.1".into(),
            port,
        };
        let target = deliver(
            &db,
            &channel,
            Path::new("/unused"),
            PrintKind::KitchenTicket,
            "order:1",
            b"\x1B@hello",
        )
        .await
        .expect("delivered");
        assert_eq!(target, format!("127.0.0.1:{port}"));
        assert_eq!(server.await.unwrap(), b"\x1B@hello");

        let conn = db.conn.lock().unwrap();
        assert_eq!(db::count_print_attempts(&conn, "order:1"), 1);
    }

    #[tokio::test]
    async fn test_device_intent_writes_spool_file() {
        let dir = std::env::temp_dir().join(format!("comanda-spool-{}", uuid::Uuid::new_v4()));
        let db = db::test_state();
        let path = deliver(
            &db,
            &PrintChannel::DeviceIntent,
            &dir,
            PrintKind::Bill,
            "table:4",
            b"bill",
        )
        .await
        .expect("spooled");
        assert_eq!(std::fs::read(&path).unwrap(), b"bill");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_recorded() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let db = db::test_state();
        let channel = PrintChannel::Network {
            host: "127.0.0.1".into(),
            port,
        };
        let result = deliver(&db, &channel, Path::new("/unused"), PrintKind::Bill, "table:9", b"x").await;
        assert!(result.is_err());

        let conn = db.conn.lock().unwrap();
        let success: bool = conn
            .query_row(
                "SELECT success FROM print_log WHERE reference = 'table:9'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!success);
    }
}
