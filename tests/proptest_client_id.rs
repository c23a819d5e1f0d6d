use std::net::Ipv6Addr;

use proptest::prelude::*;

use leasewarden::{ClientId, Parity, derive_v6};

fn format_mac(octets: &[u8; 6], lowercase: bool) -> String {
    octets
        .iter()
        .map(|octet| {
            if lowercase {
                format!("{octet:02x}")
            } else {
                format!("{octet:02X}")
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn parse_never_panics_on_arbitrary_text(input in ".{0,40}") {
        let _ = ClientId::parse(&input);
    }

    #[test]
    fn parse_accepts_either_case_and_canonicalizes(octets in any::<[u8; 6]>(), lowercase in any::<bool>()) {
        let client = ClientId::parse(&format_mac(&octets, lowercase)).unwrap();
        prop_assert_eq!(client.octets(), octets);
        prop_assert_eq!(client.to_string(), format_mac(&octets, false));
    }

    #[test]
    fn parse_rejects_wrong_separators(octets in any::<[u8; 6]>(), separator in "[-. _]") {
        let input = format_mac(&octets, false).replace(':', &separator);
        prop_assert!(ClientId::parse(&input).is_err());
    }

    #[test]
    fn eui64_preserves_all_but_universal_local_bit(octets in any::<[u8; 6]>()) {
        let eui = ClientId::new(octets).eui64();
        prop_assert_eq!(eui[0] ^ octets[0], 0x02);
        prop_assert_eq!(&eui[1..3], &octets[1..3]);
        prop_assert_eq!(&eui[3..5], &[0xff, 0xfe][..]);
        prop_assert_eq!(&eui[5..], &octets[3..]);
    }

    #[test]
    fn derive_v6_is_injective_and_keeps_prefix(a in any::<[u8; 6]>(), b in any::<[u8; 6]>()) {
        let prefix: Ipv6Addr = "2001:db8::".parse().unwrap();
        let first = derive_v6(prefix, &ClientId::new(a));
        let second = derive_v6(prefix, &ClientId::new(b));

        prop_assert_eq!(&first.octets()[..8], &prefix.octets()[..8]);
        prop_assert_eq!(a == b, first == second);
    }

    #[test]
    fn parity_matches_octet_sum(octets in any::<[u8; 6]>()) {
        let sum: u32 = octets.iter().map(|&octet| u32::from(octet)).sum();
        let expected = if sum % 2 == 1 { Parity::Odd } else { Parity::Even };
        prop_assert_eq!(ClientId::new(octets).octet_parity(), expected);
    }
}
