#[cfg(test)]
mod tests {
    use crate::forker::{ForkRequest, RELOAD_ID, REQUEST_SIZE};

    #[test]
    fn test_request_fits_into_one_pipe_write() {
        // atomicity of the request channel depends on this
        assert!(REQUEST_SIZE < libc::PIPE_BUF);
    }

    #[test]
    fn test_spawn_request_roundtrip() {
        let request = ForkRequest::Spawn { id: 7 };
        let decoded = ForkRequest::decode(&request.encode());

        assert_eq!(decoded, ForkRequest::Spawn { id: 7 });
    }

    #[test]
    fn test_stop_request_carries_the_pid() {
        let request = ForkRequest::Stop { id: 3, pid: 4711 };
        let decoded = ForkRequest::decode(&request.encode());

        assert_eq!(decoded, ForkRequest::Stop { id: 3, pid: 4711 });
    }

    #[test]
    fn test_reload_wire_invariants() {
        let buf = ForkRequest::Reload.encode();

        let id = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let pid = i32::from_ne_bytes([buf[5], buf[6], buf[7], buf[8]]);

        // reload travels as a negative sentinel id with start=true, pid=0
        assert_eq!(id, RELOAD_ID);
        assert_eq!(buf[4], 1);
        assert_eq!(pid, 0);

        assert_eq!(ForkRequest::decode(&buf), ForkRequest::Reload);
    }

    #[test]
    fn test_any_negative_id_decodes_as_reload() {
        let mut buf = ForkRequest::Spawn { id: 1 }.encode();
        buf[0..4].copy_from_slice(&(-42i32).to_ne_bytes());

        assert_eq!(ForkRequest::decode(&buf), ForkRequest::Reload);
    }
}
