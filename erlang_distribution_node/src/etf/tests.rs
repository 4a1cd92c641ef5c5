use super::consts::tag;
use super::*;

fn round_trip(term: Term) {
    let bytes = term.encode();
    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded, term, "bytes: {:?}", bytes);
}

fn pid(id: u32) -> Pid {
    Pid::new("alice@localhost", id, 0, 3)
}

#[test]
fn integers_round_trip_at_boundaries() {
    for value in [
        0i64,
        -1,
        255,
        256,
        i64::from(i32::MAX),
        i64::from(i32::MIN),
        1 << 31,
        -(1 << 31) - 1,
        i64::MAX,
        i64::MIN,
    ] {
        round_trip(Term::from(value));
    }
    round_trip(Term::from(1u64 << 63));
    round_trip(Term::from(u64::MAX));
    round_trip(Term::from(i128::MAX));
}

#[test]
fn integers_use_the_smallest_tag() {
    assert_eq!(Term::from(255).encode(), vec![131, tag::SMALL_INTEGER_EXT, 255]);
    assert_eq!(
        Term::from(256).encode(),
        vec![131, tag::INTEGER_EXT, 0, 0, 1, 0]
    );
    assert_eq!(
        Term::from(-1).encode(),
        vec![131, tag::INTEGER_EXT, 0xff, 0xff, 0xff, 0xff]
    );

    let two_pow_31 = Term::from(1i64 << 31);
    assert!(matches!(two_pow_31, Term::BigInt(_)));
    assert_eq!(
        two_pow_31.encode(),
        vec![131, tag::SMALL_BIG_EXT, 4, 0, 0, 0, 0, 0x80]
    );
    assert_eq!(two_pow_31.as_integer(), Some(1 << 31));
}

#[test]
fn large_big_round_trips() {
    let big = Term::BigInt(BigInt {
        negative: true,
        digits: vec![7; 300],
    });
    let bytes = big.encode();
    assert_eq!(bytes[1], tag::LARGE_BIG_EXT);
    round_trip(big);
}

#[test]
fn scalars_round_trip() {
    round_trip(Term::Float(0.0));
    round_trip(Term::Float(-1.5e300));
    round_trip(Term::atom("ok"));
    round_trip(Term::atom("ünïcödé"));
    round_trip(Term::atom("é".repeat(255)));
    round_trip(Term::binary(Vec::new()));
    round_trip(Term::binary(b"hello".to_vec()));
    round_trip(Term::bitstring(vec![0xff, 0x80], 1));
    round_trip(Term::boolean(true));
}

#[test]
fn identities_round_trip() {
    round_trip(Term::Pid(pid(42)));
    round_trip(Term::Port(Port {
        node: Atom::from("alice@localhost"),
        id: 12,
        creation: 1,
    }));
    let wide_port = Term::Port(Port {
        node: Atom::from("alice@localhost"),
        id: 1 << 40,
        creation: 1,
    });
    assert_eq!(wide_port.encode()[1], tag::V4_PORT_EXT);
    round_trip(wide_port);
    round_trip(Term::Reference(Reference {
        node: Atom::from("alice@localhost"),
        creation: 7,
        ids: vec![1, 2, 3],
    }));
}

#[test]
fn functions_round_trip() {
    round_trip(Term::Export(Box::new(Export {
        module: Atom::from("lists"),
        function: Atom::from("map"),
        arity: 2,
    })));
    round_trip(Term::Fun(Box::new(Fun {
        arity: 1,
        uniq: [9; 16],
        index: 3,
        module: Atom::from("shell"),
        old_index: Term::from(3),
        old_uniq: Term::from(123_456),
        pid: pid(1),
        free_vars: vec![Term::atom("x"), Term::from(5)],
    })));
}

#[test]
fn fun_size_field_counts_itself() {
    let fun = Term::Fun(Box::new(Fun {
        arity: 0,
        uniq: [0; 16],
        index: 0,
        module: Atom::from("m"),
        old_index: Term::from(0),
        old_uniq: Term::from(0),
        pid: pid(1),
        free_vars: Vec::new(),
    }));
    let bytes = fun.encode();
    let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    // version + tag precede the size field
    assert_eq!(size, bytes.len() - 2);
}

#[test]
fn compounds_round_trip() {
    round_trip(Term::tuple(Vec::new()));
    round_trip(Term::tuple((0..300i32).map(Term::from).collect()));
    round_trip(Term::map(Vec::new()));
    round_trip(Term::map(vec![
        (Term::atom("a"), Term::from(1)),
        (Term::binary(b"b".to_vec()), Term::list(vec![Term::atom("x")])),
    ]));
    round_trip(Term::list(vec![Term::atom("a"), Term::from(-5)]));
    round_trip(Term::improper_list(
        vec![Term::from(1), Term::from(2)],
        Term::atom("tail"),
    ));

    let mut nested = Term::atom("core");
    for depth in 0..5i32 {
        nested = Term::tuple(vec![Term::from(depth), nested]);
    }
    round_trip(nested);
}

#[test]
fn byte_lists_use_the_string_tag() {
    let list = Term::list((0..=255i32).map(Term::from).collect());
    assert!(matches!(list, Term::String(_)));
    assert_eq!(list.encode()[1], tag::STRING_EXT);
    round_trip(list);

    // A raw list of small integers is compacted at encode time as well.
    let raw = Term::List(vec![Term::from(1), Term::from(2)], Box::new(Term::Nil));
    assert_eq!(raw.encode(), vec![131, tag::STRING_EXT, 0, 2, 1, 2]);
    round_trip(raw);
}

#[test]
fn out_of_range_element_forces_a_full_list() {
    let mut elements: Vec<Term> = (0..10i32).map(Term::from).collect();
    elements.push(Term::from(256));
    let list = Term::list(elements);
    assert_eq!(list.encode()[1], tag::LIST_EXT);
    round_trip(list);

    assert_eq!(Term::charlist("abc").encode()[1], tag::STRING_EXT);
    assert_eq!(Term::charlist("λx").encode()[1], tag::LIST_EXT);
}

#[test]
fn overlong_byte_list_falls_back_to_a_full_list() {
    let long = Term::String(vec![1; MAX_STRING_EXT_LEN + 1]);
    assert_eq!(long.encode()[1], tag::LIST_EXT);
    round_trip(long);
}

#[test]
fn empty_lists_are_nil() {
    assert_eq!(Term::list(Vec::new()).encode(), vec![131, tag::NIL_EXT]);
    assert_eq!(Term::String(Vec::new()).encode(), vec![131, tag::NIL_EXT]);
    assert_eq!(
        Term::List(Vec::new(), Box::new(Term::Nil)).encode(),
        vec![131, tag::NIL_EXT]
    );
    assert!(matches!(decode(&[131, tag::NIL_EXT]).unwrap(), Term::Nil));
}

#[test]
fn maps_keep_insertion_order_and_overwrite_duplicates() {
    let map = Term::map(vec![
        (Term::atom("b"), Term::from(1)),
        (Term::atom("a"), Term::from(2)),
        (Term::atom("b"), Term::from(3)),
    ]);
    let Term::Map(pairs) = &map else {
        panic!("expected a map, got {:?}", map);
    };
    assert_eq!(
        pairs,
        &vec![
            (Term::atom("b"), Term::from(3)),
            (Term::atom("a"), Term::from(2)),
        ]
    );

    // Duplicate keys on the wire are folded the same way.
    let wire = vec![
        131,
        tag::MAP_EXT,
        0,
        0,
        0,
        2,
        tag::SMALL_INTEGER_EXT,
        1,
        tag::SMALL_INTEGER_EXT,
        10,
        tag::SMALL_INTEGER_EXT,
        1,
        tag::SMALL_INTEGER_EXT,
        20,
    ];
    assert_eq!(
        decode(&wire).unwrap(),
        Term::map(vec![(Term::from(1), Term::from(20))])
    );
}

#[test]
fn legacy_tags_decode() {
    // SMALL_ATOM_EXT in latin-1
    assert_eq!(
        decode(&[131, tag::SMALL_ATOM_EXT, 2, b'o', 0xe9]).unwrap(),
        Term::atom("oé")
    );

    // PID_EXT with a one byte creation
    let mut bytes = vec![131, tag::PID_EXT, tag::SMALL_ATOM_UTF8_EXT, 1, b'n'];
    bytes.extend_from_slice(&5u32.to_be_bytes());
    bytes.extend_from_slice(&6u32.to_be_bytes());
    bytes.push(2);
    assert_eq!(decode(&bytes).unwrap(), Term::Pid(Pid::new("n", 5, 6, 2)));

    // FLOAT_EXT as printed text
    let mut bytes = vec![131, tag::FLOAT_EXT];
    let mut text = format!("{:.20e}", 1.5f64).into_bytes();
    text.resize(31, 0);
    bytes.extend_from_slice(&text);
    assert_eq!(decode(&bytes).unwrap(), Term::Float(1.5));
}

#[test]
fn truncated_input_is_rejected() {
    let bytes = Term::tuple(vec![Term::atom("hello"), Term::from(1000)]).encode();
    for len in 0..bytes.len() {
        assert_eq!(
            decode(&bytes[..len]).unwrap_err(),
            DecodeError::Truncated,
            "prefix of length {}",
            len
        );
    }
}

#[test]
fn unknown_tag_is_rejected() {
    assert_eq!(decode(&[131, 1]).unwrap_err(), DecodeError::UnknownTag(1));
    assert_eq!(decode(&[130, 106]).unwrap_err(), DecodeError::BadVersion(130));
}

#[test]
fn identity_with_non_atom_node_is_rejected() {
    let mut bytes = vec![131, tag::NEW_PID_EXT, tag::SMALL_INTEGER_EXT, 1];
    bytes.extend_from_slice(&[0; 12]);
    assert_eq!(
        decode(&bytes).unwrap_err(),
        DecodeError::UnexpectedTerm {
            expected: "atom",
            context: "pid node"
        }
    );
}

#[test]
fn trailing_bytes_are_rejected() {
    assert_eq!(
        decode(&[131, tag::NIL_EXT, 0]).unwrap_err(),
        DecodeError::TrailingBytes(1)
    );
    let (term, rest) = decode_prefix(&[131, tag::NIL_EXT, 0], 8).unwrap();
    assert!(term.is_nil());
    assert_eq!(rest, &[0]);
}

#[test]
fn depth_bound_is_enforced() {
    let mut nested = Term::Nil;
    for _ in 0..10 {
        nested = Term::tuple(vec![nested]);
    }
    let bytes = nested.encode();
    assert!(decode_with_depth(&bytes, 10).is_ok());
    assert_eq!(
        decode_with_depth(&bytes, 9).unwrap_err(),
        DecodeError::TooDeep(9)
    );
}

#[test]
fn list_shapes_compare_by_elements() {
    assert_eq!(
        Term::String(b"ab".to_vec()),
        Term::List(vec![Term::from(97), Term::from(98)], Box::new(Term::Nil))
    );
    assert_eq!(Term::Nil, Term::String(Vec::new()));
    assert_ne!(Term::String(b"ab".to_vec()), Term::binary(b"ab".to_vec()));
    assert_ne!(
        Term::list(vec![Term::from(1)]),
        Term::improper_list(vec![Term::from(1)], Term::from(2))
    );
}

#[test]
fn empty_lists_are_equal_in_every_shape() {
    assert_eq!(Term::Nil, Term::Nil);
    assert_eq!(Term::Nil, Term::list(vec![]));
    assert_eq!(Term::list(vec![]), Term::String(Vec::new()));
    assert_eq!(
        Term::String(vec![1]),
        Term::List(vec![Term::from(1)], Box::new(Term::Nil))
    );
    assert_ne!(Term::Nil, Term::tuple(vec![]));
}

#[test]
fn small_bignums_encode_as_integers() {
    let bytes = Term::BigInt(BigInt::from_i128(5)).encode();
    assert_eq!(bytes, vec![131, tag::SMALL_INTEGER_EXT, 5]);
    assert_eq!(decode(&bytes).unwrap(), Term::from(5));

    let bytes = Term::BigInt(BigInt::from_i128(-70_000)).encode();
    assert_eq!(bytes[1], tag::INTEGER_EXT);
    assert_eq!(decode(&bytes).unwrap(), Term::from(-70_000));

    let wide = Term::BigInt(BigInt::from_i128(i32::MAX as i128 + 1));
    assert_eq!(wide.encode()[1], tag::SMALL_BIG_EXT);
}

#[test]
fn atoms_are_limited_to_255_characters() {
    assert!(Atom::try_new("a".repeat(255)).is_ok());
    assert!(Atom::try_new("é".repeat(255)).is_ok());
    assert_eq!(
        Atom::try_new("a".repeat(256)).unwrap_err(),
        AtomTooLong(256)
    );

    let mut bytes = vec![131, tag::ATOM_UTF8_EXT, 0x01, 0x2c];
    bytes.extend(std::iter::repeat(b'a').take(300));
    assert_eq!(decode(&bytes).unwrap_err(), DecodeError::AtomTooLong(300));
}

#[test]
#[should_panic]
fn atom_new_panics_past_the_limit() {
    let _ = Atom::new("a".repeat(256));
}
