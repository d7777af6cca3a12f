//! Parsing of `ip route show default` output

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::space1,
    multi::many0,
    sequence::preceded,
    Parser,
};
use std::net::Ipv4Addr;

/// The host's default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub via: Option<Ipv4Addr>,
    pub dev: String,
}

fn token(input: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace()).parse(input)
}

fn default_line(input: &str) -> nom::IResult<&str, Vec<&str>> {
    preceded(tag("default"), many0(preceded(space1, token))).parse(input)
}

/// Find the first default route that names an outbound device
///
/// Lines look like `default via 192.168.1.1 dev eth0 proto dhcp metric 100`
/// or `default dev wg0 scope link`.
pub fn parse_default_route(output: &str) -> Option<DefaultRoute> {
    for line in output.lines() {
        let Ok((_, tokens)) = default_line(line.trim()) else {
            continue;
        };

        let value_of = |key: &str| {
            tokens
                .windows(2)
                .find(|pair| pair[0] == key)
                .map(|pair| pair[1])
        };

        if let Some(dev) = value_of("dev") {
            return Some(DefaultRoute {
                via: value_of("via").and_then(|v| v.parse().ok()),
                dev: dev.to_string(),
            });
        }
    }

    None
}
