#[cfg(test)]
mod tests {
    use crate::app::AppRegistry;
    use crate::client::Client;
    use crate::config::{AppConfig, ConnectRetryConfig, PredefinedGraphDef};
    use crate::extension::{Extension, ExtensionEnv};
    use crate::graph::{GraphNode, GraphSpec, NodeType};
    use crate::msg::{Loc, Msg, MsgType, StartGraphPayload, StatusCode};
    use crate::utils::uri::Uri;
    use std::time::Duration;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    // Answers every "ping*" command with its own name; a "quit" data
    // message tears the graph down from inside.
    struct Echo;

    impl Extension for Echo {
        fn on_msg(&mut self, msg: Msg, env: &ExtensionEnv) {
            match msg.kind {
                MsgType::Cmd if msg.name.starts_with("ping") => {
                    env.send_result(StatusCode::Ok, &msg, &msg.name);
                }
                MsgType::Data if msg.name == "quit" => {
                    env.send_msg(Msg::stop_graph(&env.loc.graph_id));
                }
                _ => {}
            }
        }
    }

    // Arms a repeating timer on "arm" and answers after the third fire.
    struct TimerUser {
        armed: Option<Msg>,
        fired: u32,
    }

    impl Extension for TimerUser {
        fn on_msg(&mut self, msg: Msg, env: &ExtensionEnv) {
            match msg.kind {
                MsgType::Cmd if msg.name == "arm" => {
                    self.armed = Some(msg);
                    env.send_msg(Msg::timer(7, 20_000, 3));
                }
                MsgType::CmdTimeout => {
                    self.fired += 1;
                    if self.fired == 3 {
                        if let Some(armed) = self.armed.take() {
                            env.send_result(StatusCode::Ok, &armed, "fired 3");
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn ext_node(app: &str, name: &str, addon: &str) -> GraphNode {
        GraphNode {
            node_type: NodeType::Extension,
            name: name.into(),
            addon: addon.into(),
            app: app.into(),
            extension_group: "main".into(),
        }
    }

    fn start_graph_cmd(graph: GraphSpec) -> Msg {
        Msg::start_graph(StartGraphPayload {
            predefined_graph_name: String::new(),
            long_running_mode: false,
            graph,
        })
    }

    fn ext_dest(app: &str, name: &str) -> Loc {
        Loc {
            app_uri: app.into(),
            graph_id: String::new(),
            extension_group: "main".into(),
            extension: name.into(),
        }
    }

    fn connect(registry: &AppRegistry, uri: &str) -> Client {
        let transport = registry.transport();
        let uri = Uri::parse(uri).unwrap();
        Client::connect(transport.as_ref(), &uri).unwrap()
    }

    #[test]
    fn single_app_graph_starts_and_answers() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();

        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.kind, MsgType::CmdResult);
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some(""));

        let mut ping = Msg::cmd("ping");
        ping.dests = vec![ext_dest("mem://alpha:1/", "echo")];
        client.send_msg(&ping).unwrap();

        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some("ping"));

        registry.close_all();
    }

    // Commands racing in right behind the start_graph are held inside
    // the connection until the handover completes, then processed in
    // arrival order.
    #[test]
    fn messages_behind_start_graph_keep_their_order() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        for i in 1..=3 {
            let mut ping = Msg::cmd(&format!("ping{i}"));
            ping.dests = vec![ext_dest("mem://alpha:1/", "echo")];
            client.send_msg(&ping).unwrap();
        }

        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        for i in 1..=3 {
            let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
            assert_eq!(res.detail(), Some(format!("ping{i}").as_str()));
        }

        registry.close_all();
    }

    #[test]
    fn predefined_graph_starts_by_name() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));

        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.predefined_graphs = Some(vec![PredefinedGraphDef {
            name: "boot".into(),
            auto_start: false,
            graph: GraphSpec {
                nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
                connections: vec![],
            },
        }]);
        registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let start = Msg::start_graph(StartGraphPayload {
            predefined_graph_name: "boot".into(),
            long_running_mode: false,
            graph: GraphSpec::default(),
        });
        client.send_msg(&start).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        let mut ping = Msg::cmd("ping");
        ping.dests = vec![ext_dest("mem://alpha:1/", "echo")];
        client.send_msg(&ping).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
        assert_eq!(res.detail(), Some("ping"));

        registry.close_all();
    }

    #[test]
    fn unknown_predefined_graph_is_an_error() {
        let mut registry = AppRegistry::new();
        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.long_running_mode = Some(true);
        registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let start = Msg::start_graph(StartGraphPayload {
            predefined_graph_name: "no-such-graph".into(),
            long_running_mode: false,
            graph: GraphSpec::default(),
        });
        client.send_msg(&start).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("result");
        assert_eq!(res.status(), Some(StatusCode::Error));
        assert!(res.detail().unwrap_or("").contains("no-such-graph"));

        registry.close_all();
    }

    #[test]
    fn missing_addon_fails_the_start() {
        let mut registry = AppRegistry::new();
        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.long_running_mode = Some(true);
        registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "ghost", "not_registered")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("result");
        assert_eq!(res.status(), Some(StatusCode::Error));
        assert!(res.detail().unwrap_or("").contains("not_registered"));

        registry.close_all();
    }

    #[test]
    fn stop_graph_without_engine_is_answered_with_error() {
        let mut registry = AppRegistry::new();
        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.long_running_mode = Some(true);
        registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        client.send_msg(&Msg::stop_graph("no-such-graph")).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("result");
        assert_eq!(res.status(), Some(StatusCode::Error));
        assert_eq!(
            res.detail(),
            Some("Failed to find the engine to be shut down.")
        );

        // The connection went back to square one; the next command is
        // again treated as a first message and answered the same way.
        client.send_msg(&Msg::stop_graph("still-missing")).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("second result");
        assert_eq!(res.status(), Some(StatusCode::Error));

        registry.close_all();
    }

    // A graph ending from inside takes the engine down, and with no
    // engines left the app follows.
    #[test]
    fn graph_end_closes_the_app() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        let mut quit = Msg::data("quit");
        quit.dests = vec![ext_dest("mem://alpha:1/", "echo")];
        client.send_msg(&quit).unwrap();

        // Engine closes, the app auto-closes, the client sees EOF.
        let eof = client.recv_msg(Duration::from_secs(10)).unwrap();
        assert!(eof.is_none());
        registry.wait();
    }

    // A stop_graph arriving over the graph's own channel gets its
    // result back over that channel after the teardown, even though the
    // channel belonged to the engine being torn down.
    #[test]
    fn stop_graph_over_own_channel_is_answered_after_teardown() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        client.send_msg(&Msg::stop_graph("")).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("stop result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some("close engine done"));

        // With its last engine gone the app follows, and the channel
        // ends cleanly after the result.
        let eof = client.recv_msg(Duration::from_secs(10)).unwrap();
        assert!(eof.is_none());
        registry.wait();
    }

    // A stop_graph naming a graph this engine does not run is not its
    // own death sentence; it is handed to the app and the error comes
    // back over the same channel.
    #[test]
    fn stop_graph_for_another_graph_is_forwarded_not_fatal() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        client.send_msg(&Msg::stop_graph("no-such-graph")).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("stop result");
        assert_eq!(res.status(), Some(StatusCode::Error));
        assert_eq!(
            res.detail(),
            Some("Failed to find the engine to be shut down.")
        );

        // The engine carrying the channel is untouched.
        let mut ping = Msg::cmd("ping-after");
        ping.dests = vec![ext_dest("mem://alpha:1/", "echo")];
        client.send_msg(&ping).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
        assert_eq!(res.detail(), Some("ping-after"));

        registry.close_all();
    }

    #[test]
    fn long_running_app_survives_its_last_graph() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.long_running_mode = Some(true);
        let app = registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "echo", "echo")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        let mut quit = Msg::data("quit");
        quit.dests = vec![ext_dest("mem://alpha:1/", "echo")];
        client.send_msg(&quit).unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert!(app.is_alive());

        registry.close_all();
    }

    #[test]
    fn graph_spanning_two_apps_routes_across() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();
        registry.spawn_app(AppConfig::new("mem://beta:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![
                ext_node("mem://alpha:1/", "front", "echo"),
                ext_node("mem://beta:1/", "echo", "echo"),
            ],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        // Routed alpha to beta over the graph channel and answered all
        // the way back.
        let mut ping = Msg::cmd("ping-remote");
        ping.dests = vec![ext_dest("mem://beta:1/", "echo")];
        client.send_msg(&ping).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some("ping-remote"));

        registry.close_all();
    }

    // The two non-originator members dial each other while the graph
    // comes up; the duplicated channel is torn down without failing the
    // start.
    #[test]
    fn racing_channels_between_members_resolve() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();
        registry.spawn_app(AppConfig::new("mem://beta:1/")).unwrap();
        registry.spawn_app(AppConfig::new("mem://gamma:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![
                ext_node("mem://alpha:1/", "front", "echo"),
                ext_node("mem://beta:1/", "left", "echo"),
                ext_node("mem://gamma:1/", "right", "echo"),
            ],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some(""));

        let mut ping = Msg::cmd("ping-right");
        ping.dests = vec![ext_dest("mem://gamma:1/", "right")];
        client.send_msg(&ping).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("ping result");
        assert_eq!(res.detail(), Some("ping-right"));

        registry.close_all();
    }

    #[test]
    fn unreachable_member_fails_the_start() {
        let mut registry = AppRegistry::new();
        registry
            .extensions()
            .register("echo", Box::new(|| Box::new(Echo)));
        let mut cfg = AppConfig::new("mem://alpha:1/");
        cfg.retry = Some(ConnectRetryConfig {
            max_retries: Some(2),
            interval_ms: Some(30),
        });
        registry.spawn_app(cfg).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![
                ext_node("mem://alpha:1/", "front", "echo"),
                ext_node("mem://nowhere:9/", "void", "echo"),
            ],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();

        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("result");
        assert_eq!(res.status(), Some(StatusCode::Error));
        assert!(res.detail().unwrap_or("").contains("mem://nowhere:9/"));

        // The failed start takes the engine down, and the app with it.
        let eof = client.recv_msg(Duration::from_secs(10)).unwrap();
        assert!(eof.is_none());
        registry.wait();
    }

    #[test]
    fn graph_timer_fires_until_exhausted() {
        let mut registry = AppRegistry::new();
        registry.extensions().register(
            "timer_user",
            Box::new(|| {
                Box::new(TimerUser {
                    armed: None,
                    fired: 0,
                })
            }),
        );
        registry.spawn_app(AppConfig::new("mem://alpha:1/")).unwrap();

        let mut client = connect(&registry, "mem://alpha:1/");
        let graph = GraphSpec {
            nodes: vec![ext_node("mem://alpha:1/", "ticker", "timer_user")],
            connections: vec![],
        };
        client.send_msg(&start_graph_cmd(graph)).unwrap();
        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("start result");
        assert_eq!(res.status(), Some(StatusCode::Ok));

        let mut arm = Msg::cmd("arm");
        arm.dests = vec![ext_dest("mem://alpha:1/", "ticker")];
        client.send_msg(&arm).unwrap();

        let res = client.recv_msg(RECV_TIMEOUT).unwrap().expect("arm result");
        assert_eq!(res.status(), Some(StatusCode::Ok));
        assert_eq!(res.detail(), Some("fired 3"));

        registry.close_all();
    }
}
