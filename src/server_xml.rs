//! Connector secret migration in the container's `server.xml`.
//!
//! Containers at or above 9.0.31 call the AJP peer-authentication secret
//! `secret`; older ones call it `requiredSecret`. The migration renames
//! the attribute in whichever direction the deployed container needs,
//! including inside comments documenting commented-out connectors. An
//! already-populated destination attribute is never overwritten, and a
//! connector with neither attribute is an error: the secret is mandatory.

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::types::ContainerVersion;
use std::fs;
use std::io::BufReader;
use xmltree::{Element, EmitterConfig, XMLNode};

const AJP_PROTOCOL: &str = "AJP/1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Rename `requiredSecret` to `secret`.
    ToSecret,
    /// Rename `secret` back to `requiredSecret`.
    ToRequiredSecret,
}

impl Direction {
    pub fn for_container(version: &ContainerVersion) -> Direction {
        if *version >= ContainerVersion::new(&[9, 0, 31]) {
            Direction::ToSecret
        } else {
            Direction::ToRequiredSecret
        }
    }

    fn source(&self) -> &'static str {
        match self {
            Direction::ToSecret => "requiredSecret",
            Direction::ToRequiredSecret => "secret",
        }
    }

    fn destination(&self) -> &'static str {
        match self {
            Direction::ToSecret => "secret",
            Direction::ToRequiredSecret => "requiredSecret",
        }
    }
}

/// Rename the secret attribute of every AJP connector in the document,
/// and in comments mentioning AJP connectors.
pub fn migrate_connector_secret(server: &mut Element, direction: Direction) -> Result<()> {
    let source = direction.source();
    let destination = direction.destination();

    for node in &mut server.children {
        let XMLNode::Element(service) = node else {
            continue;
        };
        if service.name != "Service" {
            continue;
        }

        for child in &mut service.children {
            match child {
                XMLNode::Comment(text) => {
                    if text.contains("protocol=\"AJP/1.3\"") {
                        *text = text
                            .replace(&format!("{}=", source), &format!("{}=", destination));
                    }
                }

                XMLNode::Element(connector) if connector.name == "Connector" => {
                    if connector.attributes.get("protocol").map(String::as_str)
                        != Some(AJP_PROTOCOL)
                    {
                        continue;
                    }

                    let value = connector.attributes.remove(source);
                    log::debug!("AJP connector {}: {:?}", source, value);

                    if connector
                        .attributes
                        .get(destination)
                        .is_some_and(|v| !v.is_empty())
                    {
                        continue;
                    }

                    let value = value.filter(|v| !v.is_empty()).ok_or_else(|| {
                        Error::NotFound(format!("Missing AJP connector {}", source))
                    })?;

                    connector.attributes.insert(destination.to_string(), value);
                }

                _ => {}
            }
        }
    }

    Ok(())
}

/// Rewrite the instance `server.xml` with the secret attribute the
/// deployed container expects.
pub fn configure_connectors(instance: &Instance, container: &ContainerVersion) -> Result<()> {
    let direction = Direction::for_container(container);
    let path = instance.server_xml();

    log::info!("Configuring AJP connector secrets in {}", path.display());

    let file = fs::File::open(&path)?;
    let mut server = Element::parse(BufReader::new(file))?;

    migrate_connector_secret(&mut server, direction)?;

    let out = fs::File::create(&path)?;
    server.write_with_config(out, EmitterConfig::new().perform_indent(true))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Element {
        Element::parse(xml.as_bytes()).unwrap()
    }

    fn connector(server: &Element) -> &Element {
        server
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Element(e) if e.name == "Service" => Some(e),
                _ => None,
            })
            .unwrap()
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Element(e) if e.name == "Connector" => Some(e),
                _ => None,
            })
            .unwrap()
    }

    const LEGACY: &str = r#"<Server>
  <Service name="Catalina">
    <Connector port="8009" protocol="AJP/1.3" requiredSecret="Tomcat.123"/>
    <Connector port="8443" protocol="HTTP/1.1" secure="true"/>
  </Service>
</Server>"#;

    #[test]
    fn test_rename_to_secret() {
        let mut server = parse(LEGACY);
        migrate_connector_secret(&mut server, Direction::ToSecret).unwrap();

        let ajp = connector(&server);
        assert_eq!(ajp.attributes.get("secret").map(String::as_str), Some("Tomcat.123"));
        assert!(!ajp.attributes.contains_key("requiredSecret"));
    }

    #[test]
    fn test_round_trip_restores_attribute() {
        let mut server = parse(LEGACY);
        migrate_connector_secret(&mut server, Direction::ToSecret).unwrap();
        migrate_connector_secret(&mut server, Direction::ToRequiredSecret).unwrap();

        let ajp = connector(&server);
        assert_eq!(
            ajp.attributes.get("requiredSecret").map(String::as_str),
            Some("Tomcat.123")
        );
        assert!(!ajp.attributes.contains_key("secret"));
    }

    #[test]
    fn test_populated_destination_is_preserved() {
        let xml = r#"<Server>
  <Service name="Catalina">
    <Connector protocol="AJP/1.3" requiredSecret="old" secret="new"/>
  </Service>
</Server>"#;
        let mut server = parse(xml);
        migrate_connector_secret(&mut server, Direction::ToSecret).unwrap();

        let ajp = connector(&server);
        assert_eq!(ajp.attributes.get("secret").map(String::as_str), Some("new"));
        assert!(!ajp.attributes.contains_key("requiredSecret"));
    }

    #[test]
    fn test_missing_secret_is_fatal() {
        let xml = r#"<Server>
  <Service name="Catalina">
    <Connector protocol="AJP/1.3" port="8009"/>
  </Service>
</Server>"#;
        let mut server = parse(xml);

        assert!(matches!(
            migrate_connector_secret(&mut server, Direction::ToSecret),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_non_ajp_connectors_untouched() {
        let mut server = parse(LEGACY);
        migrate_connector_secret(&mut server, Direction::ToSecret).unwrap();

        let service = server
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Element(e) if e.name == "Service" => Some(e),
                _ => None,
            })
            .unwrap();
        let http = service
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Element(e)
                    if e.name == "Connector"
                        && e.attributes.get("protocol").map(String::as_str)
                            == Some("HTTP/1.1") =>
                {
                    Some(e)
                }
                _ => None,
            })
            .unwrap();

        assert!(!http.attributes.contains_key("secret"));
        assert!(!http.attributes.contains_key("requiredSecret"));
    }

    #[test]
    fn test_comments_are_rewritten() {
        let xml = "<Server>\n  <Service name=\"Catalina\">\n    \
                   <!-- <Connector port=\"8009\" protocol=\"AJP/1.3\" requiredSecret=\"x\"/> -->\n    \
                   <Connector protocol=\"AJP/1.3\" requiredSecret=\"y\"/>\n  \
                   </Service>\n</Server>";
        let mut server = parse(xml);
        migrate_connector_secret(&mut server, Direction::ToSecret).unwrap();

        let service = server
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Element(e) if e.name == "Service" => Some(e),
                _ => None,
            })
            .unwrap();
        let comment = service
            .children
            .iter()
            .find_map(|n| match n {
                XMLNode::Comment(text) => Some(text),
                _ => None,
            })
            .unwrap();

        assert!(comment.contains("secret=\"x\""));
        assert!(!comment.contains("requiredSecret="));
    }

    #[test]
    fn test_direction_for_container() {
        let old: ContainerVersion = "9.0.30".parse().unwrap();
        let new: ContainerVersion = "9.0.31".parse().unwrap();
        let newer: ContainerVersion = "10.1.5".parse().unwrap();

        assert_eq!(Direction::for_container(&old), Direction::ToRequiredSecret);
        assert_eq!(Direction::for_container(&new), Direction::ToSecret);
        assert_eq!(Direction::for_container(&newer), Direction::ToSecret);
    }
}
