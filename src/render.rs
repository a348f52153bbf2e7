//! Text artifacts rendered from embedded templates
//!
//! libvirt network and domain XML, cloud-init user-data and kind cluster
//! configs all come from `templates/`, compiled into the binary.

use minijinja::Environment;
use serde::Serialize;

use crate::Result;

/// libvirt network definition
pub const NETWORK_XML: &str = "network.xml";
/// libvirt domain definition
pub const DOMAIN_XML: &str = "domain.xml";
/// cloud-init user-data
pub const USER_DATA: &str = "user-data.yaml";
/// kind cluster configuration
pub const KIND_CONFIG: &str = "kind-config.yaml";

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template(NETWORK_XML, include_str!("../templates/network.xml.j2"))?;
    env.add_template(DOMAIN_XML, include_str!("../templates/domain.xml.j2"))?;
    env.add_template(USER_DATA, include_str!("../templates/user-data.yaml.j2"))?;
    env.add_template(KIND_CONFIG, include_str!("../templates/kind-config.yaml.j2"))?;
    Ok(env)
}

/// Render one embedded template with a serializable context
pub fn render<S: Serialize>(template: &str, ctx: &S) -> Result<String> {
    let env = environment()?;
    let mut out = env.get_template(template)?.render(ctx)?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn nat_network_lists_reservations() {
        let xml = render(
            NETWORK_XML,
            &context! {
                name => "k8s-net",
                bridge => "virbr-k8s",
                nat => true,
                ovs => false,
                gateway => "192.168.123.1",
                netmask => "255.255.255.0",
                dhcp_start => "192.168.123.10",
                dhcp_end => "192.168.123.200",
                reservations => vec![context! { mac => "52:54:00:00:01:11", name => "master-1", ip => "192.168.123.11" }],
            },
        )
        .unwrap();
        assert!(xml.contains("<forward mode='nat'/>"));
        assert!(xml.contains("<range start='192.168.123.10' end='192.168.123.200'/>"));
        assert!(xml.contains("<host mac='52:54:00:00:01:11' name='master-1' ip='192.168.123.11'/>"));
    }

    #[test]
    fn ovs_network_uses_bridge_forwarding() {
        let xml = render(
            NETWORK_XML,
            &context! { name => "h2d-host-1-dpu-1", bridge => "h2d-0123456789a", nat => false, ovs => true },
        )
        .unwrap();
        assert!(xml.contains("<forward mode='bridge'/>"));
        assert!(xml.contains("<virtualport type='openvswitch'/>"));
        assert!(!xml.contains("<ip "));
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(render("nope", &context! {}).is_err());
    }
}
