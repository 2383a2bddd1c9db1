//! Client behaviour against a scripted gateway.
//!
//! Each test drives a [`Client`] over a [`ChannelTransport`] and plays the
//! gateway side by hand: it reads the wire commands the client sends and
//! pushes back events in whatever order the scenario calls for.

use gateway_bridge::orders::{OpenOrderReport, StatusUpdate};
use gateway_bridge::transport::EventSender;
use gateway_bridge::{
    Action, ChannelTransport, Client, ClientConfig, ClientError, InboundEvent, Instrument, OrderKind, OrderSpec,
    OrderStatus, RequestId, WireCommand,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

struct Gateway {
    commands: UnboundedReceiver<WireCommand>,
    events: Option<EventSender>,
}

impl Gateway {
    async fn expect(&mut self) -> WireCommand {
        tokio::time::timeout(Duration::from_secs(60), self.commands.recv())
            .await
            .expect("timed out waiting for a wire command")
            .expect("command channel closed")
    }

    fn send(&self, event: InboundEvent) {
        assert!(self.events.as_ref().expect("not connected").send(event));
    }

    /// Answer the connect sequence of a client-0 connection
    async fn handshake(&mut self, next_id: RequestId) {
        match self.expect().await {
            WireCommand::Connect { events, .. } => self.events = Some(events),
            other => panic!("expected connect, got {}", other.name()),
        }
        assert!(matches!(self.expect().await, WireCommand::RequestAutoOpenOrders(true)));
        assert!(matches!(self.expect().await, WireCommand::RequestNextIds(_)));
        self.send(InboundEvent::NextValidId(next_id));
    }

    fn assert_quiet(&mut self) {
        assert!(self.commands.try_recv().is_err(), "unexpected wire command");
    }
}

async fn connected() -> (Arc<Client>, Gateway) {
    let (transport, commands) = ChannelTransport::new();
    let client = Arc::new(Client::new(ClientConfig::default(), Arc::new(transport)));
    let mut gateway = Gateway {
        commands,
        events: None,
    };
    let (next, _) = tokio::join!(client.connect(), gateway.handshake(100));
    assert_eq!(next.unwrap(), 100);
    (client, gateway)
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn status(request_id: RequestId, perm_id: i64, status: &str, filled: f64, avg: f64) -> InboundEvent {
    InboundEvent::OrderStatus(StatusUpdate {
        request_id,
        status: status.to_string(),
        filled,
        remaining: 10.0 - filled,
        avg_fill_price: avg,
        perm_id,
        parent_id: 0,
        last_fill_price: avg,
        client_id: 0,
    })
}

fn open_order(request_id: RequestId, perm_id: i64, spec: OrderSpec, status: &str) -> InboundEvent {
    InboundEvent::OpenOrder(OpenOrderReport {
        request_id,
        perm_id,
        client_id: 0,
        instrument: Instrument::stock("SPY", "USD"),
        spec,
        status: status.to_string(),
    })
}

async fn placed(gateway: &mut Gateway) -> (RequestId, OrderSpec) {
    match gateway.expect().await {
        WireCommand::PlaceOrder { request_id, spec, .. } => (request_id, spec),
        other => panic!("expected place_order, got {}", other.name()),
    }
}

mod connection {
    use super::*;

    #[tokio::test]
    async fn ids_start_at_gateway_next_valid_id() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let id = client.place_order(&spy, OrderSpec::market(Action::Buy, 1.0)).await.unwrap();
        let (sent, _) = placed(&mut gateway).await;
        assert_eq!(sent, id);
        assert!(id >= 100);
    }

    #[tokio::test]
    async fn connection_loss_fails_waiters_and_streams() {
        let (client, mut gateway) = connected().await;
        let mut stream = client.subscribe_ticks(&Instrument::stock("SPY", "USD")).await.unwrap();
        assert!(matches!(gateway.expect().await, WireCommand::RequestMarketData { .. }));

        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.get_account_name().await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::RequestManagedAccounts));

        gateway.send(InboundEvent::ConnectionClosed {
            reason: "socket reset".to_string(),
        });

        assert_eq!(waiting.await.unwrap(), Err(ClientError::Disconnected));
        assert_eq!(stream.recv().await, Some(Err(ClientError::Disconnected)));
        assert_eq!(stream.recv().await, None);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn informational_errors_fail_nothing() {
        let (client, mut gateway) = connected().await;
        let waiting = tokio::spawn({
            let client = client.clone();
            async move { client.get_account_name().await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::RequestManagedAccounts));

        gateway.send(InboundEvent::Error {
            request_id: -1,
            code: 2104,
            message: "Market data farm connection is OK".to_string(),
        });
        gateway.send(InboundEvent::ManagedAccounts("DU111,DU222".to_string()));

        assert_eq!(waiting.await.unwrap().unwrap(), "DU111");
    }
}

mod contracts {
    use super::*;

    #[tokio::test]
    async fn first_contract_wins() {
        let (client, mut gateway) = connected().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.resolve_contract(&Instrument::stock("AAPL", "USD")).await }
        });

        let request_id = match gateway.expect().await {
            WireCommand::RequestContractDetails { request_id, instrument } => {
                assert_eq!(instrument.local_symbol, "");
                request_id
            }
            other => panic!("expected contract request, got {}", other.name()),
        };
        for (con_id, exchange) in [(265598, "NASDAQ"), (38708077, "MEXI")] {
            let mut instrument = Instrument::stock("AAPL", "USD");
            instrument.con_id = con_id;
            instrument.primary_exchange = exchange.to_string();
            gateway.send(InboundEvent::ContractDetails { request_id, instrument });
        }
        gateway.send(InboundEvent::ContractDetailsEnd(request_id));

        let contract = pending.await.unwrap().unwrap();
        assert_eq!(contract.con_id, 265598);
    }

    #[tokio::test]
    async fn remote_error_fails_the_request() {
        let (client, mut gateway) = connected().await;
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.resolve_contract(&Instrument::stock("NOPE", "USD")).await }
        });
        let WireCommand::RequestContractDetails { request_id, .. } = gateway.expect().await else {
            panic!("expected contract request");
        };
        gateway.send(InboundEvent::Error {
            request_id,
            code: 200,
            message: "No security definition has been found".to_string(),
        });

        assert!(matches!(
            pending.await.unwrap(),
            Err(ClientError::Remote { code: 200, .. })
        ));
    }
}

mod orders {
    use super::*;

    #[tokio::test]
    async fn bracket_children_sent_once() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let parent = client
            .place_bracket_order(&spy, OrderSpec::market(Action::Buy, 10.0), 5.0, 3.0)
            .await
            .unwrap();
        placed(&mut gateway).await;

        gateway.send(open_order(parent, 900, OrderSpec::market(Action::Buy, 10.0), "Submitted"));
        gateway.send(status(parent, 900, "Filled", 10.0, 100.0));
        gateway.send(status(parent, 900, "Filled", 10.0, 100.0));

        let (profit_id, profit) = placed(&mut gateway).await;
        let (loss_id, loss) = placed(&mut gateway).await;
        assert_eq!(profit.kind, OrderKind::Limit { price: 105.0 });
        assert_eq!(loss.kind, OrderKind::Stop { price: 97.0 });
        assert_eq!(profit.action, Action::Sell);
        assert_eq!(profit.oca_group.as_deref(), Some("900"));
        assert_eq!(loss.oca_group.as_deref(), Some("900"));

        settle().await;
        gateway.assert_quiet();

        let children = client.bracket_children(parent).unwrap();
        assert_eq!(children.profit, Some(profit_id));
        assert_eq!(children.loss, Some(loss_id));
        assert_eq!(client.order(profit_id).unwrap().parent_id, Some(parent));
    }

    #[tokio::test]
    async fn cancel_waits_for_terminal_status() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let spec = OrderSpec::limit(Action::Buy, 10.0, 90.0);
        let id = client.place_order(&spy, spec.clone()).await.unwrap();
        placed(&mut gateway).await;
        gateway.send(open_order(id, 901, spec, "Submitted"));

        let cancel = tokio::spawn({
            let client = client.clone();
            async move { client.cancel_order(id).await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::CancelOrder(c) if c == id));
        gateway.send(InboundEvent::Error {
            request_id: id,
            code: 202,
            message: "Order Canceled - reason:".to_string(),
        });
        gateway.send(status(id, 901, "Cancelled", 0.0, 0.0));

        assert_eq!(cancel.await.unwrap(), Ok(OrderStatus::Cancelled));
        assert_eq!(client.cancel_order(id).await, Ok(OrderStatus::Cancelled));
        gateway.assert_quiet();
    }

    #[tokio::test]
    async fn cancel_rejection_surfaces_error() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let spec = OrderSpec::limit(Action::Buy, 10.0, 90.0);
        let id = client.place_order(&spy, spec.clone()).await.unwrap();
        placed(&mut gateway).await;
        gateway.send(open_order(id, 902, spec, "Submitted"));

        let cancel = tokio::spawn({
            let client = client.clone();
            async move { client.cancel_order(id).await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::CancelOrder(_)));
        gateway.send(InboundEvent::Error {
            request_id: id,
            code: 10147,
            message: "OrderId that needs to be cancelled is not found".to_string(),
        });

        assert!(matches!(
            cancel.await.unwrap(),
            Err(ClientError::Remote { code: 10147, .. })
        ));
        assert!(client.order(id).unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn cancel_can_be_retried_after_rejection() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let spec = OrderSpec::limit(Action::Buy, 10.0, 90.0);
        let id = client.place_order(&spy, spec.clone()).await.unwrap();
        placed(&mut gateway).await;
        gateway.send(open_order(id, 903, spec, "Submitted"));

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.cancel_order(id).await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::CancelOrder(c) if c == id));
        gateway.send(InboundEvent::Error {
            request_id: id,
            code: 203,
            message: "The security is not available or allowed for this account".to_string(),
        });
        assert!(matches!(first.await.unwrap(), Err(ClientError::Remote { code: 203, .. })));

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.cancel_order(id).await }
        });
        assert!(matches!(gateway.expect().await, WireCommand::CancelOrder(c) if c == id));
        gateway.send(status(id, 903, "Cancelled", 0.0, 0.0));

        assert_eq!(second.await.unwrap(), Ok(OrderStatus::Cancelled));
        assert!(client.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn open_orders_wait_for_every_signal() {
        let (client, mut gateway) = connected().await;
        let query = tokio::spawn({
            let client = client.clone();
            async move { client.list_open_orders().await }
        });

        let query_id = match gateway.expect().await {
            WireCommand::RequestExecutions { request_id, .. } => request_id,
            other => panic!("expected executions request, got {}", other.name()),
        };
        assert!(matches!(gateway.expect().await, WireCommand::RequestAllOpenOrders));

        let spec = OrderSpec::limit(Action::Sell, 1.0, 50.0);
        // Order 7: status before its report. Order 8: report, status last.
        gateway.send(status(7, 700, "Submitted", 0.0, 0.0));
        gateway.send(open_order(8, 800, spec.clone(), "PreSubmitted"));
        gateway.send(InboundEvent::OpenOrderEnd);
        gateway.send(InboundEvent::ExecDetailsEnd(query_id));
        settle().await;
        assert!(!query.is_finished());

        gateway.send(open_order(7, 700, spec.clone(), "Submitted"));
        settle().await;
        assert!(!query.is_finished());

        gateway.send(status(8, 800, "Submitted", 0.0, 0.0));
        let orders = query.await.unwrap().unwrap();
        let summary: Vec<(RequestId, OrderStatus)> = orders.iter().map(|o| (o.request_id, o.status)).collect();
        assert_eq!(summary, vec![(7, OrderStatus::Submitted), (8, OrderStatus::Submitted)]);
    }

    #[tokio::test]
    async fn open_orders_empty_account() {
        let (client, mut gateway) = connected().await;
        let query = tokio::spawn({
            let client = client.clone();
            async move { client.list_open_orders().await }
        });
        let WireCommand::RequestExecutions { request_id, .. } = gateway.expect().await else {
            panic!("expected executions request");
        };
        gateway.expect().await;
        gateway.send(InboundEvent::ExecDetailsEnd(request_id));
        gateway.send(InboundEvent::OpenOrderEnd);

        assert_eq!(query.await.unwrap(), Ok(vec![]));
    }
}

mod ticks {
    use super::*;

    #[tokio::test]
    async fn one_subscription_per_key() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let mut first = client.subscribe_ticks(&spy).await.unwrap();
        let mut second = client.subscribe_ticks(&Instrument::stock("spy", "usd")).await.unwrap();

        let request_id = match gateway.expect().await {
            WireCommand::RequestMarketData { request_id, .. } => request_id,
            other => panic!("expected market data request, got {}", other.name()),
        };
        gateway.assert_quiet();

        // Bid alone is not a consistent book
        gateway.send(InboundEvent::TickPrice {
            request_id,
            field: 1,
            price: 470.10,
        });
        gateway.send(InboundEvent::TickPrice {
            request_id,
            field: 2,
            price: 470.12,
        });

        for stream in [&mut first, &mut second] {
            let tick = stream.recv().await.unwrap().unwrap();
            assert_eq!((tick.bid, tick.ask), (470.10, 470.12));
        }

        assert!(client.unsubscribe_ticks(&spy).await.unwrap());
        assert!(matches!(gateway.expect().await, WireCommand::CancelMarketData(c) if c == request_id));
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_last_stream_cancels_market_data() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let first = client.subscribe_ticks(&spy).await.unwrap();
        let second = client.subscribe_ticks(&spy).await.unwrap();
        let request_id = match gateway.expect().await {
            WireCommand::RequestMarketData { request_id, .. } => request_id,
            other => panic!("expected market data request, got {}", other.name()),
        };

        drop(first);
        gateway.send(InboundEvent::TickPrice {
            request_id,
            field: 1,
            price: 470.10,
        });
        settle().await;
        gateway.assert_quiet();

        drop(second);
        gateway.send(InboundEvent::TickPrice {
            request_id,
            field: 2,
            price: 470.12,
        });
        assert!(matches!(gateway.expect().await, WireCommand::CancelMarketData(c) if c == request_id));
        assert!(!client.unsubscribe_ticks(&spy).await.unwrap());
        gateway.assert_quiet();
    }

    #[tokio::test]
    async fn subscription_error_ends_stream() {
        let (client, mut gateway) = connected().await;
        let mut stream = client.subscribe_ticks(&Instrument::forex("EUR", "USD")).await.unwrap();
        let WireCommand::RequestMarketData { request_id, .. } = gateway.expect().await else {
            panic!("expected market data request");
        };

        gateway.send(InboundEvent::Error {
            request_id,
            code: 354,
            message: "Requested market data is not subscribed".to_string(),
        });

        assert!(matches!(
            stream.recv().await,
            Some(Err(ClientError::Remote { code: 354, .. }))
        ));
        assert_eq!(stream.recv().await, None);
    }
}

mod history {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gateway_bridge::Bar;

    fn bar(second: u32) -> Bar {
        Bar {
            time: Utc.with_ymd_and_hms(2024, 1, 5, 15, 0, second).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
            count: 0,
            wap: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn windows_issued_at_pacing_interval() {
        let (transport, commands) = ChannelTransport::new();
        let mut config = ClientConfig::default();
        config.history.max_block_bars = 30;
        let client = Client::new(config, Arc::new(transport));
        let mut gateway = Gateway {
            commands,
            events: None,
        };
        let (next, _) = tokio::join!(client.connect(), gateway.handshake(1));
        next.unwrap();

        let forex = Instrument::forex("EUR", "USD");
        let mut plan = client
            .plan_history(&forex, "2024-01-05 10:00:00", "2024-01-05 10:01:00", "America/New_York")
            .unwrap();
        assert_eq!(plan.remaining(), 2);

        let script = async {
            let mut issued = Vec::new();
            for _ in 0..2 {
                let WireCommand::RequestHistoricalData { request_id, request, .. } = gateway.expect().await else {
                    panic!("expected historical request");
                };
                issued.push((tokio::time::Instant::now(), request));
                gateway.send(InboundEvent::HistoricalBar {
                    request_id,
                    bar: bar(0),
                });
                gateway.send(InboundEvent::HistoricalDataEnd(request_id));
            }
            issued
        };
        let consume = async {
            let mut blocks = Vec::new();
            while let Some(block) = plan.next().await.unwrap() {
                blocks.push(block);
            }
            blocks
        };
        let (issued, blocks) = tokio::join!(script, consume);

        assert_eq!(blocks.len(), 2);
        assert!(issued[1].0 - issued[0].0 >= Duration::from_secs(18));
        assert_eq!(issued[0].1.end_time, "20240105 15:00:30 UTC");
        assert_eq!(issued[0].1.duration, "30 S");
        assert_eq!(issued[0].1.what_to_show, "BID_ASK");
    }

    #[tokio::test]
    async fn cancelled_plan_drops_late_bars() {
        let (client, mut gateway) = connected().await;
        let spy = Instrument::stock("SPY", "USD");
        let mut plan = client
            .plan_history(&spy, "2024-01-05 10:00", "2024-01-05 12:00", "America/New_York")
            .unwrap();
        assert_eq!(plan.remaining(), 4);
        let cancel = plan.cancel_handle();

        let script = async {
            let WireCommand::RequestHistoricalData { request_id, .. } = gateway.expect().await else {
                panic!("expected historical request");
            };
            cancel.cancel();
            request_id
        };
        let (request_id, block) = tokio::join!(script, plan.next());
        assert_eq!(block, Ok(None));
        assert_eq!(plan.remaining(), 0);

        gateway.send(InboundEvent::HistoricalBar {
            request_id,
            bar: bar(0),
        });
        gateway.send(InboundEvent::HistoricalDataEnd(request_id));
        settle().await;
        assert!(client.diagnostics().is_empty());
        gateway.assert_quiet();
    }
}
