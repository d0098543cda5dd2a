// The proto file is compiled into Rust using prost-build driven by a
// hand-constructed FileDescriptorSet. This avoids requiring a `protoc`
// binary at build time (the previous `tonic_build::compile_protos` call
// shells out to `protoc`, which is not available in this environment).
// The generated output is identical to what `protoc` + tonic-build would
// emit for proto/raft.proto.
use prost_types::{
    field_descriptor_proto::{Label, Type},
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
};

fn field(name: &str, number: i32, ty: Type, type_name: Option<&str>, json_name: &str) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(|s| s.to_string()),
        json_name: Some(json_name.to_string()),
        ..Default::default()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/raft.proto");

    let result_code = EnumDescriptorProto {
        name: Some("ResultCode".to_string()),
        value: vec![
            EnumValueDescriptorProto {
                name: Some("OK".to_string()),
                number: Some(0),
                options: None,
            },
            EnumValueDescriptorProto {
                name: Some("FAIL".to_string()),
                number: Some(1),
                options: None,
            },
        ],
        ..Default::default()
    };

    let post_data_request = DescriptorProto {
        name: Some("PostDataRequest".to_string()),
        field: vec![field("data", 1, Type::Bytes, None, "data")],
        ..Default::default()
    };

    let post_data_response = DescriptorProto {
        name: Some("PostDataResponse".to_string()),
        field: vec![field(
            "ret",
            1,
            Type::Enum,
            Some(".raft.ResultCode"),
            "ret",
        )],
        ..Default::default()
    };

    let service = ServiceDescriptorProto {
        name: Some("RaftService".to_string()),
        method: vec![MethodDescriptorProto {
            name: Some("PostData".to_string()),
            input_type: Some(".raft.PostDataRequest".to_string()),
            output_type: Some(".raft.PostDataResponse".to_string()),
            options: None,
            client_streaming: Some(false),
            server_streaming: Some(false),
        }],
        options: None,
    };

    let file = FileDescriptorProto {
        name: Some("raft.proto".to_string()),
        package: Some("raft".to_string()),
        message_type: vec![post_data_request, post_data_response],
        enum_type: vec![result_code],
        service: vec![service],
        syntax: Some("proto3".to_string()),
        ..Default::default()
    };

    let fds = FileDescriptorSet { file: vec![file] };

    let mut config = prost_build::Config::new();
    config.service_generator(tonic_build::configure().service_generator());
    config.compile_fds(fds)?;

    Ok(())
}
