mod common;

use common::build_archive;
use lpak::archive::Archive;
use lpak::io_stream::WindowedStream;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::io::{Cursor, Read, Seek, SeekFrom};

#[derive(Debug, Clone)]
enum Op {
    Read(usize),
    Start(u64),
    Current(i64),
    End(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..64).prop_map(Op::Read),
        (0u64..300).prop_map(Op::Start),
        (-300i64..300).prop_map(Op::Current),
        (-300i64..300).prop_map(Op::End),
    ]
}

proptest! {
    #[test]
    fn window_cursor_stays_in_bounds(
        data in prop::collection::vec(any::<u8>(), 0..256),
        start_frac in 0.0f64..=1.0,
        size in 0u64..300,
        ops in prop::collection::vec(op(), 0..32),
    ) {
        let start = (data.len() as f64 * start_frac) as u64;
        let size = size.min(data.len() as u64 - start);
        let src = Mutex::new(Cursor::new(data.clone()));
        let mut w = WindowedStream::new(&src, start, size);

        for op in ops {
            let before = w.tell();
            match op {
                Op::Read(n) => {
                    let mut buf = vec![0u8; n];
                    let got = w.read(&mut buf).unwrap();
                    let at = (start + before) as usize;
                    prop_assert_eq!(&buf[..got], &data[at..at + got]);
                    prop_assert_eq!(got as u64, (n as u64).min(size - before));
                }
                Op::Start(n) => {
                    prop_assert_eq!(w.seek(SeekFrom::Start(n)).unwrap(), n.min(size));
                }
                Op::Current(d) => {
                    let target = before as i64 + d;
                    match w.seek(SeekFrom::Current(d)) {
                        Ok(pos) => prop_assert_eq!(pos as i64, target.min(size as i64)),
                        Err(_) => {
                            prop_assert!(target < 0);
                            prop_assert_eq!(w.tell(), before);
                        }
                    }
                }
                Op::End(d) => {
                    let target = size as i64 + d;
                    match w.seek(SeekFrom::End(d)) {
                        Ok(pos) => prop_assert_eq!(pos as i64, target.min(size as i64)),
                        Err(_) => prop_assert!(target < 0),
                    }
                }
            }
            prop_assert!(w.tell() <= size);
        }
    }

    #[test]
    fn every_member_reads_back(
        members in prop::collection::vec(
            ("[a-z]{1,8}(/[a-z]{1,8}){0,2}", prop::collection::vec(any::<u8>(), 0..64)),
            1..12,
        ),
        wide in any::<bool>(),
    ) {
        let version = if wide { 1.5 } else { 1.0 };
        let ar = Archive::from_reader(Cursor::new(build_archive(version, &members))).unwrap();

        // Later duplicates replace earlier ones.
        for (name, _) in &members {
            let expected = &members.iter().rev().find(|(n, _)| n == name).unwrap().1;
            let mut got = Vec::new();
            ar.open_member(name).unwrap().read_to_end(&mut got).unwrap();
            prop_assert_eq!(&got, expected);
        }
    }
}
