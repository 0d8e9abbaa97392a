#[cfg(test)]
mod tests {
    use crate::engine::is_pid_alive;
    use crate::error::{ConvertError, CoreError};
    use crate::profile::{ConfigKind, CoreType, ListenerPort, ProfileItem, ProtocolType};
    use crate::service::{ActivationOrigin, CoreEvent, CoreState, CoreSupervisor};
    use crate::settings::SupervisorSettings;
    use crate::store::ProfileStore;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    const PROXY_YAML: &str = r#"
proxies:
  - name: "🇺🇸US-1"
    type: ss
    server: us.example.com
    port: 8388
  - name: HK-2
    type: vmess
    server: hk.example.com
    port: 443
"#;

    fn harness() -> (tempfile::TempDir, CoreSupervisor) {
        harness_with(|_| {})
    }

    fn harness_with(tweak: impl FnOnce(&mut SupervisorSettings)) -> (tempfile::TempDir, CoreSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = SupervisorSettings {
            port_check_attempts: 20,
            port_check_timeout_ms: 200,
            port_check_backoff_ms: 50,
            stop_timeout_ms: 1000,
            child_stop_timeout_ms: 500,
            startup_grace_ms: 300,
            ..SupervisorSettings::with_data_dir(dir.path())
        };
        tweak(&mut settings);
        fs::create_dir_all(&settings.bin_dir).unwrap();
        let store = Arc::new(ProfileStore::in_dir(dir.path()));
        (dir, CoreSupervisor::new(settings, store))
    }

    #[cfg(unix)]
    fn fake_engine(sup: &CoreSupervisor, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = sup.settings().bin_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn read_pid(path: &Path) -> u32 {
        fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<CoreEvent>,
        wanted: impl Fn(&CoreEvent) -> bool,
    ) -> CoreEvent {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await;
        found.expect("expected event did not arrive")
    }

    fn classic_profile(sup: &CoreSupervisor, port: u16) -> ProfileItem {
        sup.store()
            .upsert(ProfileItem::new("local", CoreType::Xray, "", port))
    }

    #[tokio::test]
    async fn missing_binary_leaves_profile_stopped() {
        let (_dir, sup) = harness();
        let profile = classic_profile(&sup, free_port());
        let mut rx = sup.subscribe();

        let err = sup.start(&profile.id).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::BinaryNotFound {
                core_type: CoreType::Xray,
                ..
            }
        ));
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
        assert!(sup.running_profiles().is_empty());
        assert!(!sup.is_running(&profile.id));
        assert!(sup.binary_name(&profile.id).is_none());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::State {
                state: CoreState::Stopped,
                reason: Some(reason),
                ..
            } = event
            {
                assert!(reason.contains("xray"));
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn stopping_a_never_started_profile_twice_is_a_noop() {
        let (_dir, sup) = harness();
        let mut rx = sup.subscribe();
        sup.stop("never-started").await;
        sup.stop("never-started").await;
        assert_eq!(sup.state("never-started"), CoreState::Stopped);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unknown_profile_cannot_start() {
        let (_dir, sup) = harness();
        assert!(matches!(
            sup.start("ghost").await,
            Err(CoreError::ProfileNotFound(id)) if id == "ghost"
        ));
    }

    #[tokio::test]
    async fn start_selected_requires_a_selection() {
        let (_dir, sup) = harness();
        assert!(matches!(
            sup.start_selected().await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn classic_engine_runs_and_stops_cleanly() {
        let (dir, sup) = harness();
        let port = free_port();
        fake_engine(
            &sup,
            "xray",
            &format!(
                "echo \"Xray 1.8.4 started\"\n\
                 echo \"[Info] transport/internet/tcp: listening TCP on 127.0.0.1:{}\"\n\
                 exec sleep 30",
                port
            ),
        );
        let profile = classic_profile(&sup, port);

        sup.start(&profile.id).await.unwrap();
        assert_eq!(sup.state(&profile.id), CoreState::Running);
        assert!(sup.is_running(&profile.id));
        assert_eq!(sup.binary_name(&profile.id).as_deref(), Some("xray"));
        let pid = sup.pid(&profile.id).unwrap();

        let config = sup.launch_config(&profile.id).unwrap();
        assert!(config.contains(&format!("\"port\": {}", port)));
        assert!(dir
            .path()
            .join("work")
            .join(&profile.id)
            .join("config.json")
            .exists());

        // the engine's own listening line marks the profile running
        let store = sup.store().clone();
        let id = profile.id.clone();
        assert!(wait_until(|| store.get(&id).is_some_and(|p| p.is_running)).await);

        sup.stop(&profile.id).await;
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
        assert!(sup.pid(&profile.id).is_none());
        assert!(sup.running_profiles().is_empty());
        assert!(sup.launch_config(&profile.id).is_none());
        assert!(sup.binary_name(&profile.id).is_none());
        assert!(!sup.store().get(&profile.id).unwrap().is_running);
        assert!(wait_until(|| !is_pid_alive(pid)).await);

        sup.stop(&profile.id).await;
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn classic_engine_refuses_taken_port() {
        let (_dir, sup) = harness();
        fake_engine(&sup, "xray", "exec sleep 30");
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let profile = classic_profile(&sup, port);

        assert!(matches!(
            sup.start(&profile.id).await,
            Err(CoreError::PortUnavailable(p)) if p == port
        ));
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
        assert!(sup.pid(&profile.id).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn classic_engine_needs_a_port() {
        let (_dir, sup) = harness();
        fake_engine(&sup, "xray", "exec sleep 30");
        let profile = classic_profile(&sup, 0);
        assert!(matches!(
            sup.start(&profile.id).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn immediate_exit_reports_stderr() {
        let (_dir, sup) = harness();
        fake_engine(
            &sup,
            "xray",
            "echo \"failed to load config: unknown field\" >&2\nexit 23",
        );
        let profile = classic_profile(&sup, free_port());

        match sup.start(&profile.id).await {
            Err(CoreError::ProcessSpawn { binary, reason }) => {
                assert_eq!(binary, "xray");
                assert!(reason.contains("unknown field"), "reason: {}", reason);
            }
            other => panic!("expected spawn failure, got {:?}", other),
        }
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
        assert!(sup.running_profiles().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn converted_profile_launches_with_generated_listeners() {
        let (dir, sup) = harness();
        fake_engine(
            &sup,
            "clash",
            "echo \"$@\" > \"$(dirname \"$0\")/args.txt\"\nexec sleep 30",
        );
        let source = dir.path().join("sub.yaml");
        fs::write(&source, PROXY_YAML).unwrap();

        let start = free_port().min(60000);
        let mut item = ProfileItem::new("sub", CoreType::Clash, &source.to_string_lossy(), start);
        item.config_kind = ConfigKind::ConvertedYaml;
        let profile = sup.store().upsert(item);

        sup.start(&profile.id).await.unwrap();
        let stored = sup.store().get(&profile.id).unwrap();
        let summary: Vec<_> = stored
            .listeners
            .iter()
            .map(|l| (l.name.as_str(), l.port, l.bound_proxy_name.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![("mixed0", start, "US-1"), ("mixed1", start + 1, "HK-2")]
        );

        let run_dir = dir.path().join("work").join(&profile.id);
        assert!(run_dir.join("config.yaml").exists());
        assert!(sup
            .launch_config(&profile.id)
            .unwrap()
            .contains("Line Selection"));

        let args_file = sup.settings().bin_dir.join("args.txt");
        assert!(wait_until(|| args_file.exists()).await);
        let args = fs::read_to_string(&args_file).unwrap();
        assert!(args.starts_with("-f "));
        assert!(args.contains("config.yaml -d "));

        sup.stop(&profile.id).await;
        let stopped = sup.store().get(&profile.id).unwrap();
        assert!(stopped.listeners.iter().all(|l| !l.is_active));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn port_check_marks_declared_listener_active() {
        let (dir, sup) = harness();
        fake_engine(&sup, "clash", "exec sleep 30");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = dir.path().join("custom.yaml");
        fs::write(&config, format!("mixed-port: {}\n", port)).unwrap();
        let mut item = ProfileItem::new("mine", CoreType::Clash, &config.to_string_lossy(), port);
        item.listeners
            .push(ListenerPort::new("mixed", ProtocolType::Mixed, port, "global"));
        let profile = sup.store().upsert(item);
        let mut rx = sup.subscribe();

        sup.start(&profile.id).await.unwrap();
        let event = next_event(&mut rx, |e| matches!(e, CoreEvent::PortActive { .. })).await;
        match event {
            CoreEvent::PortActive {
                profile_id,
                port: active,
                origin,
            } => {
                assert_eq!(profile_id, profile.id);
                assert_eq!(active, port);
                assert_eq!(origin, ActivationOrigin::Probe);
            }
            _ => unreachable!(),
        }
        let stored = sup.store().get(&profile.id).unwrap();
        assert!(stored.is_running);
        assert!(stored.listeners[0].is_active);

        sup.stop(&profile.id).await;
        let stopped = sup.store().get(&profile.id).unwrap();
        assert!(!stopped.is_running);
        assert!(!stopped.listeners[0].is_active);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn custom_clash_profile_discovers_ports() {
        let (dir, sup) = harness();
        fake_engine(&sup, "clash", "exec sleep 30");
        let config = dir.path().join("custom.yaml");
        fs::write(&config, "mixed-port: 17890\nsocks-port: 17891\n").unwrap();
        let profile = sup.store().upsert(ProfileItem::new(
            "mine",
            CoreType::Clash,
            &config.to_string_lossy(),
            17890,
        ));

        sup.start(&profile.id).await.unwrap();
        let ports: Vec<u16> = sup
            .store()
            .get(&profile.id)
            .unwrap()
            .listeners
            .iter()
            .map(|l| l.port)
            .collect();
        assert_eq!(ports, vec![17890, 17891]);
        sup.stop(&profile.id).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_processes_spawned_by_the_engine() {
        let (dir, sup) = harness();
        let pid_file = dir.path().join("child.pid");
        fake_engine(
            &sup,
            "xray",
            &format!(
                "sleep 30 &\necho $! > \"{}\"\nexec sleep 30",
                pid_file.display()
            ),
        );
        let profile = classic_profile(&sup, free_port());

        sup.start(&profile.id).await.unwrap();
        assert!(
            wait_until(|| fs::read_to_string(&pid_file).is_ok_and(|s| !s.trim().is_empty()))
                .await
        );
        let child: u32 = fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(is_pid_alive(child));

        sup.stop(&profile.id).await;
        assert!(wait_until(|| !is_pid_alive(child)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_restarts_a_running_profile() {
        let (_dir, sup) = harness();
        fake_engine(&sup, "xray", "exec sleep 30");
        let profile = classic_profile(&sup, free_port());

        sup.start(&profile.id).await.unwrap();
        let first = sup.pid(&profile.id).unwrap();
        sup.start(&profile.id).await.unwrap();
        let second = sup.pid(&profile.id).unwrap();

        assert_ne!(first, second);
        assert_eq!(sup.running_profiles(), vec![profile.id.clone()]);
        assert!(wait_until(|| !is_pid_alive(first)).await);
        sup.stop(&profile.id).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_exit_is_noticed() {
        let (_dir, sup) = harness();
        fake_engine(&sup, "xray", "echo up\nsleep 1\nexit 3");
        let profile = classic_profile(&sup, free_port());
        let mut rx = sup.subscribe();

        sup.start(&profile.id).await.unwrap();
        let event = next_event(&mut rx, |e| {
            matches!(
                e,
                CoreEvent::State {
                    state: CoreState::Stopped,
                    ..
                }
            )
        })
        .await;
        if let CoreEvent::State { reason, .. } = event {
            assert!(reason.unwrap().contains("exited unexpectedly"));
        }
        assert!(sup.pid(&profile.id).is_none());
        assert!(!sup.store().get(&profile.id).unwrap().is_running);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_cleanup_does_not_clobber_a_restart() {
        // a child that ignores SIGTERM keeps the exit cleanup busy for a while
        let (dir, sup) = harness_with(|s| s.child_stop_timeout_ms = 3000);
        let flag = dir.path().join("launched");
        let grandchild_file = dir.path().join("grandchild.pid");
        fake_engine(
            &sup,
            "xray",
            &format!(
                "if [ -f \"{flag}\" ]; then exec sleep 30; fi\n\
                 touch \"{flag}\"\n\
                 ( trap '' TERM; exec sleep 30 ) >/dev/null 2>&1 &\n\
                 echo $! > \"{grandchild}\"\n\
                 sleep 1\n\
                 exit 0",
                flag = flag.display(),
                grandchild = grandchild_file.display()
            ),
        );
        let profile = classic_profile(&sup, free_port());

        sup.start(&profile.id).await.unwrap();
        let grandchild = read_pid(&grandchild_file);
        assert!(wait_until(|| sup.pid(&profile.id).is_none()).await);

        // waits for the exit cleanup to finish before launching again
        sup.start(&profile.id).await.unwrap();
        let relaunched = sup.pid(&profile.id).unwrap();
        assert!(wait_until(|| !is_pid_alive(grandchild)).await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sup.state(&profile.id), CoreState::Running);
        assert_eq!(sup.pid(&profile.id), Some(relaunched));
        assert_eq!(sup.binary_name(&profile.id).as_deref(), Some("xray"));
        assert!(sup.launch_config(&profile.id).is_some());
        assert_eq!(sup.running_profiles(), vec![profile.id.clone()]);

        sup.stop(&profile.id).await;
        assert!(wait_until(|| !is_pid_alive(relaunched)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_startup_grace_wins() {
        let (dir, sup) = harness();
        let pid_file = dir.path().join("engine.pid");
        fake_engine(
            &sup,
            "xray",
            &format!("echo $$ > \"{}\"\nexec sleep 30", pid_file.display()),
        );
        let profile = classic_profile(&sup, free_port());

        let (started, ()) = tokio::join!(sup.start(&profile.id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sup.stop(&profile.id).await;
        });
        started.unwrap();

        assert!(sup.pid(&profile.id).is_none());
        assert_eq!(sup.state(&profile.id), CoreState::Stopped);
        assert!(sup.running_profiles().is_empty());
        let pid = read_pid(&pid_file);
        assert!(wait_until(|| !is_pid_alive(pid)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_gets_a_fresh_port_timeout_report() {
        let (_dir, sup) = harness_with(|s| {
            s.port_check_attempts = 10;
            s.port_check_backoff_ms = 100;
        });
        fake_engine(&sup, "xray", "exec sleep 30");
        let port = free_port();
        let profile = classic_profile(&sup, port);

        sup.start(&profile.id).await.unwrap();
        assert!(sup.monitor().is_watching(port));
        let mut rx = sup.subscribe();
        sup.start(&profile.id).await.unwrap();
        assert!(sup.monitor().is_watching(port));

        let id = profile.id.clone();
        let event = next_event(&mut rx, |e| {
            matches!(e, CoreEvent::PortTimeout { profile_id, .. } if *profile_id == id)
        })
        .await;
        assert!(matches!(event, CoreEvent::PortTimeout { port: p, .. } if p == port));
        sup.stop(&profile.id).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_all_resets_every_profile() {
        let (_dir, sup) = harness();
        fake_engine(&sup, "xray", "exec sleep 30");
        let running = classic_profile(&sup, free_port());

        let mut stale = ProfileItem::new("stale", CoreType::Clash, "", 7890);
        stale.is_running = true;
        stale
            .listeners
            .push(ListenerPort::new("mixed0", ProtocolType::Mixed, 7890, "x"));
        stale.listeners[0].is_active = true;
        let stale = sup.store().upsert(stale);

        sup.start(&running.id).await.unwrap();
        sup.stop_all().await;

        assert!(sup.running_profiles().is_empty());
        assert!(sup.monitor().in_flight().is_empty());
        let stale = sup.store().get(&stale.id).unwrap();
        assert!(!stale.is_running);
        assert!(!stale.listeners[0].is_active);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_a_running_profile_stops_it_first() {
        let (dir, sup) = harness();
        fake_engine(&sup, "xray", "exec sleep 30");
        let profile = classic_profile(&sup, free_port());
        sup.store().set_selected(&profile.id).unwrap();

        sup.start_selected().await.unwrap();
        let pid = sup.pid(&profile.id).unwrap();
        sup.remove_profile(&profile.id).await;

        assert!(sup.store().get(&profile.id).is_none());
        assert!(sup.store().selected().is_none());
        assert!(!dir.path().join("work").join(&profile.id).exists());
        assert!(wait_until(|| !is_pid_alive(pid)).await);
    }

    #[test]
    fn import_converts_clash_subscription() {
        let (dir, sup) = harness();
        let src = dir.path().join("sub.yaml");
        fs::write(&src, PROXY_YAML).unwrap();

        let outcome = sup
            .import_clash_profile(&src, "sub", CoreType::ClashMeta, 20000)
            .unwrap();
        assert!(outcome.conversion_error.is_none());
        let profile = outcome.profile;
        assert_eq!(profile.config_kind, ConfigKind::ConvertedYaml);
        assert!(profile.config_path.ends_with("source.yaml"));
        assert_eq!(
            profile.listeners.iter().map(|l| l.port).collect::<Vec<_>>(),
            vec![20000, 20001]
        );
        assert_eq!(sup.store().get(&profile.id), Some(profile.clone()));
        assert_eq!(fs::read_to_string(&profile.config_path).unwrap(), PROXY_YAML);
    }

    #[test]
    fn import_without_proxies_keeps_a_custom_profile() {
        let (dir, sup) = harness();
        let src = dir.path().join("plain.yaml");
        fs::write(&src, "mixed-port: 7890\nmode: rule\n").unwrap();

        let outcome = sup
            .import_clash_profile(&src, "plain", CoreType::Clash, 0)
            .unwrap();
        assert!(matches!(
            outcome.conversion_error,
            Some(ConvertError::MissingProxies)
        ));
        assert_eq!(outcome.profile.config_kind, ConfigKind::Custom);
        assert_eq!(outcome.profile.primary_port, 7890);
        assert_eq!(outcome.profile.listeners.len(), 1);
        assert_eq!(outcome.profile.listeners[0].port, 7890);
    }

    #[test]
    fn import_rejects_classic_engines_and_missing_files() {
        let (dir, sup) = harness();
        let src = dir.path().join("sub.yaml");
        fs::write(&src, PROXY_YAML).unwrap();
        assert!(matches!(
            sup.import_clash_profile(&src, "x", CoreType::Xray, 0),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            sup.import_clash_profile(Path::new("/nonexistent/sub.yaml"), "x", CoreType::Clash, 0),
            Err(CoreError::ConfigIo { .. })
        ));
    }
}
