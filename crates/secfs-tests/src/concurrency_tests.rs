//! Several clients writing through the same servers.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::harness::TestShare;
    use crate::servers::InterferingVersionServer;
    use secfs_meta::{MetaError, Principal, SessionConfig, UserId};
    use secfs_store::VersionServer;

    fn u(id: u64) -> UserId {
        UserId::new(id)
    }

    #[test]
    fn test_lost_race_is_retried() {
        let share = TestShare::new(&[0]);
        let server = Arc::new(InterferingVersionServer::new());
        let mut s0 = share.session_on(0, SessionConfig::default(), server.clone());
        let root = s0.init(u(0)).unwrap();
        let f = s0
            .create(root, b"f", u(0), Principal::user(0), false, None)
            .unwrap();

        server.interfere_once();
        assert_eq!(s0.write(u(0), f, 0, b"eventually", None).unwrap(), 10);
        assert_eq!(s0.read(u(0), f, 0, 64, None).unwrap(), b"eventually".to_vec());
    }

    #[test]
    fn test_exhausted_retries_surface_conflict_without_leaking() {
        let share = TestShare::new(&[0]);
        let server = Arc::new(InterferingVersionServer::new());
        let no_retries = SessionConfig {
            max_conflict_retries: 0,
            ..SessionConfig::default()
        };
        let mut s0 = share.session_on(0, no_retries, server.clone());
        let root = s0.init(u(0)).unwrap();
        let f = s0
            .create(root, b"f", u(0), Principal::user(0), false, None)
            .unwrap();
        s0.write(u(0), f, 0, b"before", None).unwrap();
        let blocks = share.blocks.len();
        let generation = server.fetch_all().unwrap().generation;

        server.interfere_once();
        assert!(matches!(
            s0.write(u(0), f, 0, b"after!", None),
            Err(MetaError::Conflict(_))
        ));
        assert_eq!(share.blocks.len(), blocks);
        assert_eq!(server.fetch_all().unwrap().generation, generation + 1);
        assert_eq!(s0.read(u(0), f, 0, 64, None).unwrap(), b"before".to_vec());
    }

    #[test]
    fn test_parallel_writers_in_shared_directory() {
        const WRITERS: u64 = 4;
        const ROUNDS: usize = 5;

        let members: Vec<u64> = (0..WRITERS).collect();
        let share = Arc::new(TestShare::new(&members).with_group(1, &members));
        let mut owner = share.session(0);
        let root = owner.init(u(0)).unwrap();
        let shared = owner
            .mkdir(root, b"shared", u(0), Principal::group(1), false, None)
            .unwrap();

        let patient = SessionConfig {
            max_conflict_retries: 1_000,
            ..SessionConfig::default()
        };
        let handles: Vec<_> = members
            .iter()
            .map(|&id| {
                let share = share.clone();
                let config = patient.clone();
                thread::spawn(move || {
                    let mut session = share.session_with(id, config);
                    let name = format!("writer-{}", id);
                    let f = session
                        .create(shared, name.as_bytes(), u(id), Principal::user(id), false, None)
                        .unwrap();
                    for round in 0..ROUNDS {
                        let line = format!("{}:{};", id, round);
                        let end = session.stat(f).unwrap().size as usize;
                        session.write(u(id), f, end, line.as_bytes(), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut reader = share.session(0);
        let listing = reader.readdir(u(0), shared, 0, None).unwrap();
        assert_eq!(listing.len(), 2 + WRITERS as usize);
        for id in 0..WRITERS {
            let name = format!("writer-{}", id);
            let f = reader
                .lookup(u(0), shared, name.as_bytes(), None)
                .unwrap()
                .unwrap();
            let expected: String = (0..ROUNDS).map(|r| format!("{}:{};", id, r)).collect();
            assert_eq!(
                reader.read(u(0), f, 0, 1024, None).unwrap(),
                expected.into_bytes()
            );
        }
    }
}
