use infra_graph::intrinsic::get_att;
use infra_graph::{LogicalId, StackBuilder};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ConstructResult;
use crate::network::Vpc;
use crate::scope::Scope;

/// TCP port or port range opened by an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Tcp(u16),
    TcpRange(u16, u16),
}

impl Port {
    fn bounds(self) -> (u16, u16) {
        match self {
            Self::Tcp(port) => (port, port),
            Self::TcpRange(from, to) => (from, to),
        }
    }

    fn label(self) -> String {
        match self {
            Self::Tcp(port) => port.to_string(),
            Self::TcpRange(from, to) => format!("{}-{}", from, to),
        }
    }
}

/// Virtual firewall attached to tasks, load balancers and VPC connectors
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    pub id: LogicalId,
    scope: Scope,
    ingress_rules: usize,
}

impl SecurityGroup {
    /// New group with unrestricted egress
    pub fn new(
        builder: &mut StackBuilder,
        scope: &Scope,
        vpc: &Vpc,
        description: &str,
    ) -> ConstructResult<Self> {
        let id = builder.add_resource(
            scope
                .resource("", "AWS::EC2::SecurityGroup")?
                .with_properties(json!({
                    "GroupDescription": description,
                    "VpcId": vpc.vpc_id(),
                    "SecurityGroupEgress": [{
                        "CidrIp": "0.0.0.0/0",
                        "Description": "Allow all outbound traffic by default",
                        "IpProtocol": "-1",
                    }],
                })),
        )?;
        Ok(Self {
            id,
            scope: scope.clone(),
            ingress_rules: 0,
        })
    }

    pub fn group_id(&self) -> Value {
        get_att(&self.id, "GroupId")
    }

    /// Admit traffic on `port` from members of `peer`. `peer` may be `self`.
    pub fn allow_from(
        &mut self,
        builder: &mut StackBuilder,
        peer: &SecurityGroup,
        port: Port,
        description: &str,
    ) -> ConstructResult<LogicalId> {
        let (from, to) = port.bounds();
        let suffix = if peer.id == self.id {
            format!("IngressSelf{}", self.ingress_rules)
        } else {
            format!("Ingress{}{}", peer.scope.name(), self.ingress_rules)
        };
        self.add_ingress(
            builder,
            &suffix,
            json!({
                "IpProtocol": "tcp",
                "FromPort": from,
                "ToPort": to,
                "GroupId": self.group_id(),
                "SourceSecurityGroupId": peer.group_id(),
                "Description": description,
            }),
            port,
        )
    }

    pub fn allow_from_any_ipv4(
        &mut self,
        builder: &mut StackBuilder,
        port: Port,
        description: &str,
    ) -> ConstructResult<LogicalId> {
        let (from, to) = port.bounds();
        let suffix = format!("IngressAnyIpv4{}", self.ingress_rules);
        self.add_ingress(
            builder,
            &suffix,
            json!({
                "IpProtocol": "tcp",
                "FromPort": from,
                "ToPort": to,
                "GroupId": self.group_id(),
                "CidrIp": "0.0.0.0/0",
                "Description": description,
            }),
            port,
        )
    }

    fn add_ingress(
        &mut self,
        builder: &mut StackBuilder,
        suffix: &str,
        properties: Value,
        port: Port,
    ) -> ConstructResult<LogicalId> {
        let rule = builder.add_resource(
            self.scope
                .resource(suffix, "AWS::EC2::SecurityGroupIngress")?
                .with_properties(properties),
        )?;
        self.ingress_rules += 1;
        debug!(group = %self.id, rule = %rule, port = %port.label(), "Added ingress rule");
        Ok(rule)
    }
}
