//! End-to-end flows through a full main-server + session-server stack.
//!
//! These tests drive the stack the way a client does: connect to the main
//! server, log in, create or list sessions, then connect to the returned
//! session-server port and join. Most run over the in-process loopback
//! transport for determinism; one smoke test exercises the UDP backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lobby_server::session_manager::{ERROR_FLEET_CAPACITY, ERROR_UNKNOWN_SESSION_TYPE};
use lobby_server::session_server::ERROR_INVALID_JOIN;
use lobby_server::{
    initialize, session_handler_raw, DeliveryMode, HostConfig, MainServer, MemoryClient,
    MemoryTransport, Session, SessionCore, SessionGenerator, SessionServerOption, UdpClient,
    UdpTransport,
};
use serde::Serialize;
use waypoint_protocol::{
    create_packet, packet_type, parse_packet, parse_payload, register_packet_type, LoginData,
    LoginResult, ParsedPacket, SessionCreationOption, SessionCreationResult, SessionJoinOption,
    SessionJoinResult, SessionListOption, SessionListResult, UserIdentifier,
};

/// Application packet type used to exercise in-session routing.
const CHAT_TYPE: u16 = 10;

struct ArenaSession {
    core: SessionCore,
}

impl Session for ArenaSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn tick(&self, _delta_seconds: f64) {}
}

/// Generator whose sessions count chat packets and (never-delivered) login
/// packets, for observing the routing filter.
fn arena_generator(chat_hits: Arc<AtomicU32>, login_hits: Arc<AtomicU32>) -> SessionGenerator {
    Arc::new(move |info, option| {
        let session = Arc::new(ArenaSession {
            core: SessionCore::new(info, option, 60.0),
        });

        let chat_hits = chat_hits.clone();
        session.core().register_packet_handler(
            CHAT_TYPE,
            session_handler_raw(move |_core, _uid| {
                chat_hits.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let login_hits = login_hits.clone();
        session.core().register_packet_handler(
            packet_type::LOGIN,
            session_handler_raw(move |_core, _uid| {
                login_hits.fetch_add(1, Ordering::Relaxed);
            }),
        );

        session
    })
}

fn idle_generator() -> SessionGenerator {
    Arc::new(|info, option| {
        Arc::new(ArenaSession {
            core: SessionCore::new(info, option, 60.0),
        })
    })
}

fn start_stack(option: SessionServerOption, port: u16) -> (MemoryTransport, MainServer) {
    initialize();
    register_packet_type(CHAT_TYPE, "Chat");

    let transport = MemoryTransport::new();
    let login: lobby_server::LoginFn = Arc::new(|_data: LoginData| LoginResult {
        success: true,
        user_identifier: Some(UserIdentifier {
            user_id: 7,
            user_token: "t".to_string(),
        }),
        error_code: None,
    });
    let main = MainServer::new(
        login,
        Arc::new(|_uid| String::new()),
        option,
        Arc::new(transport.clone()),
        &HostConfig::new(port),
    )
    .expect("main server should bind");

    (transport, main)
}

async fn request<T: Serialize>(
    client: &mut MemoryClient,
    type_id: u16,
    payload: &T,
) -> (u8, ParsedPacket) {
    let packet = create_packet(type_id, payload, DeliveryMode::Reliable, None).unwrap();
    client.send(0, &packet).await.unwrap();
    let (channel, bytes) = client
        .recv(Duration::from_secs(2))
        .await
        .expect("server should reply");
    (channel, parse_packet(&bytes).expect("reply should parse"))
}

fn creation_option(name: &str, session_type: &str) -> SessionCreationOption {
    SessionCreationOption {
        name: name.to_string(),
        password: None,
        max_players: 4,
        is_private: false,
        user_identifier: UserIdentifier {
            user_id: 7,
            user_token: String::new(),
        },
        session_type: session_type.to_string(),
    }
}

fn list_option(page: u32, per: u32, session_type: &str) -> SessionListOption {
    SessionListOption {
        name_filter: None,
        page,
        sessions_per_page: per,
        session_type: session_type.to_string(),
    }
}

#[tokio::test]
async fn login_flow_binds_peer_and_replies_reliably() {
    let (transport, main) = start_stack(SessionServerOption::default(), 12345);
    let mut client = MemoryClient::connect(&transport, 12345).await.unwrap();

    let login = LoginData {
        id: "a".to_string(),
        password: "b".to_string(),
    };
    let (channel, reply) = request(&mut client, packet_type::LOGIN, &login).await;

    assert_eq!(channel, 0);
    assert_eq!(reply.header.type_id, packet_type::LOGIN);
    let result: LoginResult = parse_payload(&reply.payload);
    assert!(result.success);
    assert_eq!(
        result.user_identifier,
        Some(UserIdentifier {
            user_id: 7,
            user_token: "t".to_string()
        })
    );
    assert_eq!(result.error_code, None);

    // the peer is now bound to uid 7 in both directions
    assert_eq!(main.peer_by_uid(7), Some(client.peer_id()));
    assert_eq!(main.peer_uid(client.peer_id()), Some(7));

    main.stop().await;
}

#[tokio::test]
async fn create_then_list_returns_the_new_session() {
    let option = SessionServerOption {
        max_sessions: 10,
        port_range: (6000, 6010),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12346);
    main.register_session_generator("", idle_generator());

    let mut client = MemoryClient::connect(&transport, 12346).await.unwrap();

    let (_, reply) = request(&mut client, packet_type::CREATE_SESSION, &creation_option("Arena", "")).await;
    assert_eq!(reply.header.type_id, packet_type::CREATE_SESSION);
    let result: SessionCreationResult = parse_payload(&reply.payload);
    assert!(result.success);
    let info = result.session_info.expect("creation carries the session info");
    assert_eq!(info.identifier.session_port, 6000);
    assert_eq!(info.identifier.session_number, 0);

    let (_, reply) = request(&mut client, packet_type::GET_SESSION_LIST, &list_option(1, 10, "")).await;
    let list: SessionListResult = parse_payload(&reply.payload);
    assert_eq!(list.total_session_count, 1);
    assert_eq!(list.sessions.len(), 1);
    assert_eq!(list.sessions[0].name, "Arena");
    assert_eq!(list.sessions[0].current_players, 0);
    assert_eq!(list.sessions[0].identifier.session_port, 6000);

    main.stop().await;
}

#[tokio::test]
async fn exhausted_fleet_reports_capacity_error() {
    let option = SessionServerOption {
        max_sessions: 1,
        port_range: (6020, 6030),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12347);
    main.register_session_generator("arena", idle_generator());
    main.register_session_generator("duel", idle_generator());

    let mut client = MemoryClient::connect(&transport, 12347).await.unwrap();

    let (_, reply) = request(&mut client, packet_type::CREATE_SESSION, &creation_option("first", "arena")).await;
    let result: SessionCreationResult = parse_payload(&reply.payload);
    assert!(result.success);

    // a second server would be needed for the new type, but the fleet cap is 1
    let (_, reply) = request(&mut client, packet_type::CREATE_SESSION, &creation_option("second", "duel")).await;
    let result: SessionCreationResult = parse_payload(&reply.payload);
    assert!(!result.success);
    assert_eq!(result.error_code, ERROR_FLEET_CAPACITY);

    main.stop().await;
}

#[tokio::test]
async fn unknown_session_type_reports_code_one() {
    let (transport, main) = start_stack(SessionServerOption::default(), 12348);
    let mut client = MemoryClient::connect(&transport, 12348).await.unwrap();

    let (_, reply) = request(&mut client, packet_type::CREATE_SESSION, &creation_option("x", "ghost")).await;
    let result: SessionCreationResult = parse_payload(&reply.payload);
    assert!(!result.success);
    assert_eq!(result.error_code, ERROR_UNKNOWN_SESSION_TYPE);

    main.stop().await;
}

#[tokio::test]
async fn join_then_leave_detaches_the_emptied_session() {
    let option = SessionServerOption {
        max_sessions: 10,
        port_range: (6040, 6050),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12349);
    main.register_session_generator("", idle_generator());

    let mut lobby = MemoryClient::connect(&transport, 12349).await.unwrap();
    let (_, reply) = request(&mut lobby, packet_type::CREATE_SESSION, &creation_option("Arena", "")).await;
    let created: SessionCreationResult = parse_payload(&reply.payload);
    let identifier = created.session_info.unwrap().identifier;
    assert_eq!(identifier.session_port, 6040);

    // connect straight to the session server and join slot 0
    let mut player = MemoryClient::connect(&transport, identifier.session_port)
        .await
        .unwrap();
    let join = SessionJoinOption {
        user_identifier: UserIdentifier {
            user_id: 7,
            user_token: "t".to_string(),
        },
        session_number: identifier.session_number,
        password: None,
    };
    let (_, reply) = request(&mut player, packet_type::JOIN_SESSION, &join).await;
    assert_eq!(reply.header.type_id, packet_type::JOIN_SESSION);
    let result: SessionJoinResult = parse_payload(&reply.payload);
    assert!(result.success);
    assert_eq!(result.error_code, 0);

    let (_, reply) = request(&mut lobby, packet_type::GET_SESSION_LIST, &list_option(1, 10, "")).await;
    let list: SessionListResult = parse_payload(&reply.payload);
    assert_eq!(list.sessions[0].current_players, 1);

    // leaving empties the session, which detaches its slot
    player.disconnect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, reply) = request(&mut lobby, packet_type::GET_SESSION_LIST, &list_option(1, 10, "")).await;
    let list: SessionListResult = parse_payload(&reply.payload);
    assert_eq!(list.total_session_count, 0);
    assert!(list.sessions.is_empty());

    main.stop().await;
}

#[tokio::test]
async fn join_with_wrong_password_is_rejected() {
    let option = SessionServerOption {
        max_sessions: 10,
        port_range: (6060, 6070),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12350);
    main.register_session_generator("", idle_generator());

    let mut lobby = MemoryClient::connect(&transport, 12350).await.unwrap();
    let creation = SessionCreationOption {
        password: Some("sesame".to_string()),
        ..creation_option("Locked", "")
    };
    let (_, reply) = request(&mut lobby, packet_type::CREATE_SESSION, &creation).await;
    let created: SessionCreationResult = parse_payload(&reply.payload);
    let info = created.session_info.unwrap();
    assert!(info.has_password);

    let mut player = MemoryClient::connect(&transport, info.identifier.session_port)
        .await
        .unwrap();
    let join = SessionJoinOption {
        user_identifier: UserIdentifier {
            user_id: 9,
            user_token: String::new(),
        },
        session_number: info.identifier.session_number,
        password: Some("wrong".to_string()),
    };
    let (_, reply) = request(&mut player, packet_type::JOIN_SESSION, &join).await;
    let result: SessionJoinResult = parse_payload(&reply.payload);
    assert!(!result.success);
    assert_eq!(result.error_code, ERROR_INVALID_JOIN);

    let good = SessionJoinOption {
        password: Some("sesame".to_string()),
        ..join
    };
    let (_, reply) = request(&mut player, packet_type::JOIN_SESSION, &good).await;
    let result: SessionJoinResult = parse_payload(&reply.payload);
    assert!(result.success);

    main.stop().await;
}

#[tokio::test]
async fn reserved_types_never_reach_session_handlers() {
    let option = SessionServerOption {
        max_sessions: 10,
        port_range: (6080, 6090),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12351);

    let chat_hits = Arc::new(AtomicU32::new(0));
    let login_hits = Arc::new(AtomicU32::new(0));
    main.register_session_generator("", arena_generator(chat_hits.clone(), login_hits.clone()));

    let mut lobby = MemoryClient::connect(&transport, 12351).await.unwrap();
    let (_, reply) = request(&mut lobby, packet_type::CREATE_SESSION, &creation_option("Arena", "")).await;
    let created: SessionCreationResult = parse_payload(&reply.payload);
    let identifier = created.session_info.unwrap().identifier;

    let mut player = MemoryClient::connect(&transport, identifier.session_port)
        .await
        .unwrap();
    let join = SessionJoinOption {
        user_identifier: UserIdentifier {
            user_id: 7,
            user_token: "t".to_string(),
        },
        session_number: identifier.session_number,
        password: None,
    };
    let (_, reply) = request(&mut player, packet_type::JOIN_SESSION, &join).await;
    let result: SessionJoinResult = parse_payload(&reply.payload);
    assert!(result.success);

    // a Login packet on a session server is dropped by the routing filter,
    // even though the session registered a handler for it
    let login = create_packet(
        packet_type::LOGIN,
        &LoginData::default(),
        DeliveryMode::Reliable,
        None,
    )
    .unwrap();
    player.send(0, &login).await.unwrap();

    // an application packet reaches the session
    let chat = create_packet(CHAT_TYPE, &"hello".to_string(), DeliveryMode::Reliable, None).unwrap();
    player.send(0, &chat).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(login_hits.load(Ordering::Relaxed), 0);
    assert_eq!(chat_hits.load(Ordering::Relaxed), 1);

    main.stop().await;
}

#[tokio::test]
async fn paging_returns_the_requested_window() {
    let option = SessionServerOption {
        max_sessions: 20,
        port_range: (6100, 6130),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12352);
    main.register_session_generator("", idle_generator());

    let mut client = MemoryClient::connect(&transport, 12352).await.unwrap();
    for i in 0..12 {
        let (_, reply) = request(
            &mut client,
            packet_type::CREATE_SESSION,
            &creation_option(&format!("room-{i:02}"), ""),
        )
        .await;
        let result: SessionCreationResult = parse_payload(&reply.payload);
        assert!(result.success);
    }

    let (_, reply) = request(&mut client, packet_type::GET_SESSION_LIST, &list_option(2, 5, "")).await;
    let list: SessionListResult = parse_payload(&reply.payload);
    assert_eq!(list.total_session_count, 12);
    assert_eq!(list.sessions.len(), 5);
    // 1-based page 2 of 5 covers items 6..10
    let names: Vec<_> = list.sessions.iter().map(|info| info.name.as_str()).collect();
    assert_eq!(names, ["room-05", "room-06", "room-07", "room-08", "room-09"]);

    main.stop().await;
}

#[tokio::test]
async fn server_types_are_reported_per_server() {
    let option = SessionServerOption {
        max_sessions: 10,
        port_range: (6140, 6150),
        ..Default::default()
    };
    let (transport, main) = start_stack(option, 12353);
    main.register_session_generator("", idle_generator());

    let mut lobby = MemoryClient::connect(&transport, 12353).await.unwrap();
    let (channel, reply) = request(&mut lobby, packet_type::GET_SERVER_TYPE, &()).await;
    assert_eq!(channel, 0);
    assert_eq!(parse_payload::<String>(&reply.payload), "MAIN_SERVER");

    let (_, reply) = request(&mut lobby, packet_type::CREATE_SESSION, &creation_option("Arena", "")).await;
    let created: SessionCreationResult = parse_payload(&reply.payload);
    let port = created.session_info.unwrap().identifier.session_port;

    let mut player = MemoryClient::connect(&transport, port).await.unwrap();
    let (_, reply) = request(&mut player, packet_type::GET_SERVER_TYPE, &()).await;
    assert_eq!(parse_payload::<String>(&reply.payload), "SESSION_SERVER");

    main.stop().await;
}

#[tokio::test]
async fn udp_stack_smoke_test() {
    initialize();

    let option = SessionServerOption {
        max_sessions: 4,
        port_range: (17600, 17610),
        ..Default::default()
    };
    let login: lobby_server::LoginFn = Arc::new(|_data| LoginResult {
        success: true,
        user_identifier: Some(UserIdentifier {
            user_id: 42,
            user_token: "udp".to_string(),
        }),
        error_code: None,
    });
    let transport = Arc::new(UdpTransport::new());
    let main = MainServer::new(
        login,
        Arc::new(|_uid| "captain".to_string()),
        option,
        transport,
        &HostConfig::new(0),
    )
    .expect("udp main server should bind");
    main.register_session_generator("", idle_generator());

    let client = UdpClient::connect(([127, 0, 0, 1], main.port()).into())
        .await
        .expect("udp handshake");

    let packet = create_packet(
        packet_type::LOGIN,
        &LoginData {
            id: "udp-user".to_string(),
            password: String::new(),
        },
        DeliveryMode::Reliable,
        None,
    )
    .unwrap();
    client.send(0, &packet).await.unwrap();

    let (channel, bytes) = client.recv(Duration::from_secs(2)).await.expect("login reply");
    assert_eq!(channel, 0);
    let reply = parse_packet(&bytes).unwrap();
    let result: LoginResult = parse_payload(&reply.payload);
    assert!(result.success);
    assert_eq!(result.user_identifier.unwrap().user_id, 42);

    let packet = create_packet(
        packet_type::CREATE_SESSION,
        &creation_option("UDP Arena", ""),
        DeliveryMode::Reliable,
        None,
    )
    .unwrap();
    client.send(0, &packet).await.unwrap();
    let (_, bytes) = client.recv(Duration::from_secs(2)).await.expect("creation reply");
    let reply = parse_packet(&bytes).unwrap();
    let result: SessionCreationResult = parse_payload(&reply.payload);
    assert!(result.success);
    let info = result.session_info.unwrap();
    assert_eq!(info.identifier.session_port, 17600);
    assert_eq!(info.author_name, "captain");

    client.disconnect().await;
    main.stop().await;
}
