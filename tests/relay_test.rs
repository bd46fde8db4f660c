#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_cluster::client::{Publisher, RequestClient, Subscriber};
    use chat_cluster::common::connection::Connection;
    use chat_cluster::common::messages::{Request, RequestData, Response};
    use chat_cluster::relay::{bus, router};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    async fn ephemeral() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    /// A fake chat server that answers every request with its own name.
    fn spawn_worker(backend: String, name: &'static str) {
        tokio::spawn(async move {
            let mut conn = Connection::connect(&backend).await.unwrap();
            while let Ok(Some(request)) = conn.read_message::<Request>().await {
                let response = Response {
                    service: name.to_string(),
                    data: Default::default(),
                };
                assert!(!request.service.is_empty());
                if conn.write_message(&response).await.is_err() {
                    return;
                }
            }
        });
    }

    fn users_request() -> Request {
        Request::new("users", RequestData::default(), 1)
    }

    #[tokio::test]
    async fn test_bus_filters_by_topic_prefix() {
        let (publish, publish_addr) = ephemeral().await;
        let (subscribe, subscribe_addr) = ephemeral().await;
        tokio::spawn(bus::serve(publish, subscribe));

        let mut subscriber = Subscriber::connect(&subscribe_addr, &["gen".to_string()])
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let publisher = Publisher::connect(publish_addr);
        assert!(publisher.publish("replication", &json!({"clock": 1})));
        assert!(publisher.publish("general", &json!({"message": "hi", "clock": 2})));

        let (topic, payload) = timeout(Duration::from_secs(5), subscriber.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(topic, "general");
        assert_eq!(payload["message"], "hi");
    }

    #[tokio::test]
    async fn test_bus_fans_out_to_every_subscriber() {
        let (publish, publish_addr) = ephemeral().await;
        let (subscribe, subscribe_addr) = ephemeral().await;
        tokio::spawn(bus::serve(publish, subscribe));

        let everything = vec![String::new()];
        let mut first = Subscriber::connect(&subscribe_addr, &everything).await.unwrap();
        let mut second = Subscriber::connect(&subscribe_addr, &everything).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        Publisher::connect(publish_addr).publish("servers", &json!({"coordinator": "a"}));

        for subscriber in [&mut first, &mut second] {
            let (topic, _) = timeout(Duration::from_secs(5), subscriber.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(topic, "servers");
        }
    }

    #[tokio::test]
    async fn test_router_round_robin() {
        let (frontend, frontend_addr) = ephemeral().await;
        let (backend, backend_addr) = ephemeral().await;
        tokio::spawn(router::serve(frontend, backend));

        spawn_worker(backend_addr.clone(), "worker_a");
        sleep(Duration::from_millis(100)).await;
        spawn_worker(backend_addr, "worker_b");
        sleep(Duration::from_millis(100)).await;

        let mut client = RequestClient::new(frontend_addr, Duration::from_secs(5));
        let mut served_by = Vec::new();
        for _ in 0..4 {
            served_by.push(client.request(&users_request()).await.unwrap().service);
        }

        assert_eq!(served_by, ["worker_a", "worker_b", "worker_a", "worker_b"]);
    }

    #[tokio::test]
    async fn test_router_holds_requests_until_a_worker_attaches() {
        let (frontend, frontend_addr) = ephemeral().await;
        let (backend, backend_addr) = ephemeral().await;
        tokio::spawn(router::serve(frontend, backend));

        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            spawn_worker(backend_addr, "late_worker");
        });

        let mut client = RequestClient::new(frontend_addr, Duration::from_secs(5));
        let response = client.request(&users_request()).await.unwrap();
        assert_eq!(response.service, "late_worker");
    }
}
