//! Port lifecycle tests against the in-process mock ovsdb-server

#[cfg(test)]
mod tests {
    use ovs_bridge::{
        open_vswitch_model, BridgeDriver, DriverConfig, DriverError, OvsDriver, PortRequest,
        OWNER_KEY,
    };
    use ovs_ovsdb::testing::MockServer;
    use ovs_ovsdb::{Atom, Datum, OvsdbClient, OvsdbError, Row, UuidRef};

    const NETNS: &str = "/var/run/netns/pod-a";
    const OWNER: &str = "test-owner";

    fn config(server: &MockServer) -> DriverConfig {
        DriverConfig {
            endpoints: server.endpoint(),
            timeout_seconds: 5,
            owner: OWNER.to_string(),
            ..Default::default()
        }
    }

    fn named(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".to_string(), Datum::string(name));
        row
    }

    async fn server_with_bridge() -> MockServer {
        let server = MockServer::start().await.unwrap();
        server.insert_row("Bridge", named("br0"));
        server
    }

    fn bridge_ports(server: &MockServer) -> Vec<Atom> {
        let bridges = server.rows_named("Bridge", "br0");
        assert_eq!(bridges.len(), 1);
        bridges[0].1["ports"].atoms().into_iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_create_port_then_lookup() {
        let server = server_with_bridge().await;
        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        assert_eq!(driver.bridge_name(), "br0");

        let request = PortRequest::new("veth1234", NETNS, "eth0")
            .vlan_tag(100)
            .ovn_port_name("ns_pod-a");
        let port_uuid = driver.create_port(&request).await.unwrap();

        assert_eq!(bridge_ports(&server), vec![Atom::Uuid(UuidRef::Real(port_uuid))]);
        let ports = server.rows_named("Port", "veth1234");
        assert_eq!(ports.len(), 1);
        let port = &ports[0].1;
        assert_eq!(port["tag"].atoms(), vec![&Atom::Integer(100)]);
        assert_eq!(port["vlan_mode"].atoms(), vec![&Atom::string("access")]);

        let ifaces = server.rows_named("Interface", "veth1234");
        assert_eq!(ifaces.len(), 1);
        let (iface_uuid, iface) = &ifaces[0];
        assert_eq!(port["interfaces"].atoms(), vec![&Atom::Uuid(UuidRef::Real(*iface_uuid))]);
        assert_eq!(
            iface["external_ids"],
            Datum::string_map([("iface-id", "ns_pod-a")])
        );

        assert_eq!(
            driver.get_ovs_port_for_cont_iface("eth0", NETNS).await.unwrap(),
            Some("veth1234".to_string())
        );
        assert_eq!(driver.get_ovs_port_for_cont_iface("eth1", NETNS).await.unwrap(), None);
        assert_eq!(
            driver.list_bridge_ports("br0").await.unwrap(),
            vec!["veth1234".to_string()]
        );
        assert_eq!(driver.get_of_port_op_state("veth1234").await.unwrap(), "");

        // The bridge set is unchanged and nothing reports an error
        assert_eq!(driver.bridge_list().await.unwrap(), vec!["br0".to_string()]);
        assert!(driver.find_interfaces_with_error().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_port_removes_rows() {
        let server = server_with_bridge().await;
        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        driver
            .create_port(&PortRequest::new("veth1", NETNS, "eth0"))
            .await
            .unwrap();

        driver.delete_port("veth1").await.unwrap();
        assert!(server.rows("Port").is_empty());
        assert!(server.rows("Interface").is_empty());
        assert!(bridge_ports(&server).is_empty());
        assert_eq!(driver.get_ovs_port_for_cont_iface("eth0", NETNS).await.unwrap(), None);

        let err = driver.delete_port("veth1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_refuses_foreign_port() {
        let server = server_with_bridge().await;
        server.insert_row("Interface", named("veth9"));
        let mut port = named("veth9");
        port.insert(
            "external_ids".to_string(),
            Datum::string_map([(OWNER_KEY, "someone-else")]),
        );
        server.insert_row("Port", port);

        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        match driver.delete_port("veth9").await.unwrap_err() {
            DriverError::NotOwner { port, owner, expected } => {
                assert_eq!(port, "veth9");
                assert_eq!(owner.as_deref(), Some("someone-else"));
                assert_eq!(expected, OWNER);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(server.rows_named("Port", "veth9").len(), 1);
        assert_eq!(server.rows_named("Interface", "veth9").len(), 1);
        assert_eq!(server.request_count("transact"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected_atomically() {
        let server = server_with_bridge().await;
        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        let request = PortRequest::new("veth1", NETNS, "eth0");
        driver.create_port(&request).await.unwrap();

        let err = driver.create_port(&request).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Ovsdb(OvsdbError::CommitFailed { .. })
        ));
        assert_eq!(server.rows("Port").len(), 1);
        assert_eq!(server.rows("Interface").len(), 1);
        assert_eq!(bridge_ports(&server).len(), 1);
    }

    #[tokio::test]
    async fn test_trunk_port() {
        let server = server_with_bridge().await;
        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        driver
            .create_port(&PortRequest::new("veth2", NETNS, "eth1").trunks(vec![10, 20]))
            .await
            .unwrap();

        let ports = server.rows_named("Port", "veth2");
        let port = &ports[0].1;
        assert_eq!(
            port["trunks"].atoms(),
            vec![&Atom::Integer(10), &Atom::Integer(20)]
        );
        assert_eq!(port["vlan_mode"].atoms(), vec![&Atom::string("trunk")]);
        assert!(port["tag"].atoms().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_never_sent() {
        let server = server_with_bridge().await;
        let driver = BridgeDriver::connect(&config(&server), "br0").await.unwrap();
        let before = server.request_count("transact");

        let err = driver
            .create_port(&PortRequest::new("veth3", NETNS, "eth0").vlan_tag(5000))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidRequest(_)));
        assert_eq!(server.request_count("transact"), before);
    }

    #[tokio::test]
    async fn test_bridge_not_found() {
        let server = server_with_bridge().await;
        match BridgeDriver::connect(&config(&server), "br-missing").await {
            Err(DriverError::BridgeNotFound(name)) => assert_eq!(name, "br-missing"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bridge should not exist"),
        }

        let driver = OvsDriver::connect(&config(&server)).await.unwrap();
        assert!(!driver.is_bridge_present("br-missing").await.unwrap());
        assert!(driver.is_bridge_present("br0").await.unwrap());
        assert_eq!(driver.bridge_list().await.unwrap(), vec!["br0".to_string()]);
    }

    #[tokio::test]
    async fn test_interfaces_with_error() {
        let server = server_with_bridge().await;
        let mut broken = named("dpdk0");
        broken.insert(
            "error".to_string(),
            Datum::Set(vec![Atom::string("could not open network device dpdk0")]),
        );
        server.insert_row("Interface", broken);
        server.insert_row("Interface", named("veth-ok"));

        let client = OvsdbClient::connect_with(
            config(&server).client_config().unwrap(),
            open_vswitch_model(),
        )
        .await
        .unwrap();
        let driver = OvsDriver::from_client(client, OWNER);
        assert_eq!(
            driver.find_interfaces_with_error().await.unwrap(),
            vec!["dpdk0".to_string()]
        );
        driver.close().await;
    }
}
