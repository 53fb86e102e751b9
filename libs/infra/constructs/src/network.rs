//! Network boundary: VPC, subnet tiers across availability zones, internet
//! and NAT egress.

use std::net::Ipv4Addr;

use infra_graph::intrinsic::{get_att, get_azs, ref_, select};
use infra_graph::{LogicalId, StackBuilder};
use serde_json::{Value, json};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, instrument};

use crate::error::{ConstructError, ConstructResult};
use crate::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
pub enum SubnetType {
    /// Routes to the internet gateway; hosts NAT gateways and load balancers
    #[strum(serialize = "Public")]
    Public,
    /// Egress through a NAT gateway, no inbound from the internet
    #[strum(serialize = "Private")]
    PrivateWithNat,
    /// No route out of the VPC
    #[strum(serialize = "Isolated")]
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetConfiguration {
    pub name: String,
    pub subnet_type: SubnetType,
    /// Prefix length; `None` splits the VPC block evenly
    pub cidr_mask: Option<u8>,
}

impl SubnetConfiguration {
    pub fn new(name: impl Into<String>, subnet_type: SubnetType) -> Self {
        Self {
            name: name.into(),
            subnet_type,
            cidr_mask: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VpcProps {
    pub cidr: String,
    pub max_azs: usize,
    /// Defaults to one per AZ when private subnets exist
    pub nat_gateways: Option<usize>,
    pub subnets: Vec<SubnetConfiguration>,
}

impl Default for VpcProps {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 2,
            nat_gateways: None,
            subnets: vec![
                SubnetConfiguration::new("Public", SubnetType::Public),
                SubnetConfiguration::new("Private", SubnetType::PrivateWithNat),
            ],
        }
    }
}

impl VpcProps {
    pub fn with_isolated_tier(mut self) -> Self {
        self.subnets
            .push(SubnetConfiguration::new("Isolated", SubnetType::Isolated));
        self
    }
}

/// IPv4 block as network address + prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn parse(cidr: &str) -> ConstructResult<Self> {
        let err = |reason: &str| ConstructError::Cidr {
            cidr: cidr.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| err("missing prefix length"))?;
        let network: Ipv4Addr = addr.parse().map_err(|_| err("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| err("bad prefix length"))?;
        if prefix > 28 || prefix < 16 {
            return Err(err("prefix length must be between /16 and /28"));
        }
        if u32::from(network) & !Self::mask(prefix) != 0 {
            return Err(err("host bits set"));
        }
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
    }

    fn size(prefix: u8) -> u64 {
        1u64 << (32 - prefix)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Carve `count` consecutive blocks of `/prefix` out of `parent`
fn carve(parent: Cidr, prefixes: &[u8]) -> ConstructResult<Vec<Cidr>> {
    let start = u32::from(parent.network) as u64;
    let end = start + Cidr::size(parent.prefix);
    let mut cursor = start;
    let mut blocks = Vec::with_capacity(prefixes.len());

    for &prefix in prefixes {
        if prefix < parent.prefix || prefix > 28 {
            return Err(ConstructError::Cidr {
                cidr: parent.to_string(),
                reason: format!("subnet mask /{} does not fit", prefix),
            });
        }
        let size = Cidr::size(prefix);
        // align to block size
        cursor = cursor.div_ceil(size) * size;
        if cursor + size > end {
            return Err(ConstructError::Cidr {
                cidr: parent.to_string(),
                reason: format!("not enough address space for {} subnets", prefixes.len()),
            });
        }
        blocks.push(Cidr {
            network: Ipv4Addr::from(cursor as u32),
            prefix,
        });
        cursor += size;
    }

    Ok(blocks)
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub id: LogicalId,
    pub route_table: LogicalId,
    pub subnet_type: SubnetType,
    pub az_index: usize,
    pub cidr: Cidr,
    /// Default route, when the tier has one
    pub default_route: Option<LogicalId>,
}

impl Subnet {
    pub fn subnet_id(&self) -> Value {
        ref_(&self.id)
    }
}

/// Handle to a declared VPC
#[derive(Debug, Clone)]
pub struct Vpc {
    pub id: LogicalId,
    pub cidr: Cidr,
    pub subnets: Vec<Subnet>,
    pub nat_gateways: Vec<LogicalId>,
    pub internet_gateway: LogicalId,
    pub gateway_attachment: LogicalId,
}

impl Vpc {
    /// Declare the VPC and every subnet tier
    #[instrument(skip(builder, props), fields(scope = %scope.path()))]
    pub fn new(builder: &mut StackBuilder, scope: &Scope, props: VpcProps) -> ConstructResult<Self> {
        if props.max_azs == 0 {
            return Err(ConstructError::invalid("Vpc", "max_azs must be at least 1"));
        }
        if !props.subnets.iter().any(|s| s.subnet_type == SubnetType::Public) {
            return Err(ConstructError::invalid("Vpc", "a public subnet tier is required"));
        }
        let has_private = props
            .subnets
            .iter()
            .any(|s| s.subnet_type == SubnetType::PrivateWithNat);
        let nat_count = if has_private {
            props.nat_gateways.unwrap_or(props.max_azs).clamp(1, props.max_azs)
        } else {
            0
        };

        let cidr = Cidr::parse(&props.cidr)?;
        let total = props.subnets.len() * props.max_azs;
        let even_prefix = cidr.prefix + (usize::BITS - (total - 1).leading_zeros()) as u8;
        let prefixes: Vec<u8> = props
            .subnets
            .iter()
            .flat_map(|config| std::iter::repeat_n(config.cidr_mask.unwrap_or(even_prefix), props.max_azs))
            .collect();
        let blocks = carve(cidr, &prefixes)?;

        let vpc = builder.add_resource(scope.resource("", "AWS::EC2::VPC")?.with_properties(json!({
            "CidrBlock": cidr.to_string(),
            "EnableDnsHostnames": true,
            "EnableDnsSupport": true,
            "InstanceTenancy": "default",
            "Tags": [{ "Key": "Name", "Value": scope.path() }],
        })))?;

        let igw = builder.add_resource(scope.resource("IGW", "AWS::EC2::InternetGateway")?.with_properties(
            json!({ "Tags": [{ "Key": "Name", "Value": scope.path() }] }),
        ))?;
        let attachment = builder.add_resource(
            scope
                .resource("VPCGW", "AWS::EC2::VPCGatewayAttachment")?
                .with_properties(json!({
                    "VpcId": ref_(&vpc),
                    "InternetGatewayId": ref_(&igw),
                })),
        )?;

        let mut subnets = Vec::new();
        let mut nat_gateways = Vec::new();
        let mut blocks = blocks.into_iter();

        // public tiers first so NAT gateways exist before private routes point at them
        let ordered = props
            .subnets
            .iter()
            .filter(|s| s.subnet_type == SubnetType::Public)
            .chain(props.subnets.iter().filter(|s| s.subnet_type != SubnetType::Public));

        for config in ordered {
            for az in 0..props.max_azs {
                let block = blocks.next().ok_or_else(|| ConstructError::Cidr {
                    cidr: cidr.to_string(),
                    reason: "ran out of subnet blocks".to_string(),
                })?;
                let subnet_scope = scope.child(format!("{}Subnet{}", config.name, az + 1));

                let subnet_id = builder.add_resource(
                    subnet_scope.resource("Subnet", "AWS::EC2::Subnet")?.with_properties(json!({
                        "VpcId": ref_(&vpc),
                        "AvailabilityZone": select(az, get_azs()),
                        "CidrBlock": block.to_string(),
                        "MapPublicIpOnLaunch": config.subnet_type == SubnetType::Public,
                        "Tags": [
                            { "Key": "Name", "Value": subnet_scope.path() },
                            { "Key": "aws-cdk:subnet-name", "Value": config.name },
                            { "Key": "aws-cdk:subnet-type", "Value": config.subnet_type.to_string() },
                        ],
                    })),
                )?;
                let route_table = builder.add_resource(
                    subnet_scope
                        .resource("RouteTable", "AWS::EC2::RouteTable")?
                        .with_properties(json!({ "VpcId": ref_(&vpc) })),
                )?;
                let association = builder.add_resource(
                    subnet_scope
                        .resource("RouteTableAssociation", "AWS::EC2::SubnetRouteTableAssociation")?
                        .with_properties(json!({
                            "RouteTableId": ref_(&route_table),
                            "SubnetId": ref_(&subnet_id),
                        })),
                )?;

                let default_route = match config.subnet_type {
                    SubnetType::Public => {
                        let route = builder.add_resource(
                            subnet_scope
                                .resource("DefaultRoute", "AWS::EC2::Route")?
                                .with_properties(json!({
                                    "RouteTableId": ref_(&route_table),
                                    "DestinationCidrBlock": "0.0.0.0/0",
                                    "GatewayId": ref_(&igw),
                                }))
                                .depends_on(&attachment),
                        )?;

                        if nat_gateways.len() < nat_count {
                            let eip = builder.add_resource(
                                subnet_scope
                                    .resource("EIP", "AWS::EC2::EIP")?
                                    .with_properties(json!({ "Domain": "vpc" })),
                            )?;
                            let nat = builder.add_resource(
                                subnet_scope
                                    .resource("NATGateway", "AWS::EC2::NatGateway")?
                                    .with_properties(json!({
                                        "SubnetId": ref_(&subnet_id),
                                        "AllocationId": get_att(&eip, "AllocationId"),
                                    }))
                                    .depends_on(&route)
                                    .depends_on(&association),
                            )?;
                            nat_gateways.push(nat);
                        }
                        Some(route)
                    }
                    SubnetType::PrivateWithNat => {
                        let nat = nat_gateways.get(az % nat_gateways.len().max(1)).ok_or_else(|| {
                            ConstructError::invalid("Vpc", "private subnets need at least one NAT gateway")
                        })?;
                        let route = builder.add_resource(
                            subnet_scope
                                .resource("DefaultRoute", "AWS::EC2::Route")?
                                .with_properties(json!({
                                    "RouteTableId": ref_(&route_table),
                                    "DestinationCidrBlock": "0.0.0.0/0",
                                    "NatGatewayId": ref_(nat),
                                })),
                        )?;
                        Some(route)
                    }
                    SubnetType::Isolated => None,
                };

                debug!(subnet = %subnet_id, cidr = %block, tier = %config.subnet_type, "Declared subnet");
                subnets.push(Subnet {
                    id: subnet_id,
                    route_table,
                    subnet_type: config.subnet_type,
                    az_index: az,
                    cidr: block,
                    default_route,
                });
            }
        }

        Ok(Self {
            id: vpc,
            cidr,
            subnets,
            nat_gateways,
            internet_gateway: igw,
            gateway_attachment: attachment,
        })
    }

    pub fn vpc_id(&self) -> Value {
        ref_(&self.id)
    }

    pub fn cidr_block(&self) -> Value {
        get_att(&self.id, "CidrBlock")
    }

    pub fn select_subnets(&self, subnet_type: SubnetType) -> Vec<&Subnet> {
        self.subnets
            .iter()
            .filter(|s| s.subnet_type == subnet_type)
            .collect()
    }

    pub fn subnet_ids(&self, subnet_type: SubnetType) -> Vec<Value> {
        self.select_subnets(subnet_type)
            .into_iter()
            .map(Subnet::subnet_id)
            .collect()
    }

    /// Default routes of a tier; load balancers wait on these so they are
    /// reachable once created
    pub fn default_routes(&self, subnet_type: SubnetType) -> Vec<LogicalId> {
        self.select_subnets(subnet_type)
            .into_iter()
            .filter_map(|s| s.default_route.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(props: VpcProps) -> ConstructResult<(Vpc, infra_graph::Manifest)> {
        let mut builder = StackBuilder::new("Test");
        let vpc = Vpc::new(&mut builder, &Scope::root("Test").child("Vpc"), props)?;
        Ok((vpc, builder.build()?))
    }

    #[test]
    fn test_cidr_parse() {
        let cidr = Cidr::parse("10.0.0.0/16").unwrap();
        assert_eq!(cidr.prefix, 16);
        assert!(Cidr::parse("10.0.0.1/16").is_err());
        assert!(Cidr::parse("10.0.0.0").is_err());
        assert!(Cidr::parse("10.0.0.0/8").is_err());
    }

    #[test]
    fn test_even_split() {
        let blocks = carve(Cidr::parse("10.0.0.0/16").unwrap(), &[18, 18, 18, 18]).unwrap();
        let rendered: Vec<String> = blocks.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["10.0.0.0/18", "10.0.64.0/18", "10.0.128.0/18", "10.0.192.0/18"]
        );
    }

    #[test]
    fn test_carve_overflow() {
        let parent = Cidr::parse("10.0.0.0/24").unwrap();
        assert!(carve(parent, &[25, 25, 25]).is_err());
    }

    #[test]
    fn test_default_vpc_layout() {
        let (vpc, manifest) = build(VpcProps::default()).unwrap();

        assert_eq!(vpc.select_subnets(SubnetType::Public).len(), 2);
        assert_eq!(vpc.select_subnets(SubnetType::PrivateWithNat).len(), 2);
        assert_eq!(vpc.nat_gateways.len(), 2);
        assert_eq!(manifest.resources_of_type("AWS::EC2::Subnet").len(), 4);
        assert_eq!(manifest.resources_of_type("AWS::EC2::NatGateway").len(), 2);
        assert_eq!(manifest.resources_of_type("AWS::EC2::Route").len(), 4);

        // every subnet belongs to this VPC
        for subnet in &vpc.subnets {
            assert!(manifest.dependencies(&subnet.id).unwrap().contains(&vpc.id));
        }
    }

    #[test]
    fn test_private_routes_use_nat() {
        let (vpc, manifest) = build(VpcProps::default()).unwrap();
        for subnet in vpc.select_subnets(SubnetType::PrivateWithNat) {
            let route = manifest
                .resource(subnet.default_route.as_ref().unwrap())
                .unwrap();
            assert!(route.property("NatGatewayId").is_some());
        }
    }

    #[test]
    fn test_isolated_tier_has_no_default_route() {
        let (vpc, _) = build(VpcProps::default().with_isolated_tier()).unwrap();
        let isolated = vpc.select_subnets(SubnetType::Isolated);
        assert_eq!(isolated.len(), 2);
        assert!(isolated.iter().all(|s| s.default_route.is_none()));
        // 6 subnets -> /19 each
        assert!(vpc.subnets.iter().all(|s| s.cidr.prefix == 19));
    }

    #[test]
    fn test_single_nat_gateway() {
        let props = VpcProps {
            nat_gateways: Some(1),
            ..Default::default()
        };
        let (vpc, _) = build(props).unwrap();
        assert_eq!(vpc.nat_gateways.len(), 1);
    }

    #[test]
    fn test_public_tier_required() {
        let props = VpcProps {
            subnets: vec![SubnetConfiguration::new("Private", SubnetType::PrivateWithNat)],
            ..Default::default()
        };
        assert!(matches!(build(props), Err(ConstructError::InvalidProps { .. })));
    }
}
