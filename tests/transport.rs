use std::cell::RefCell;
use std::rc::Rc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;
use taglink::fake::{FakePeripheral, tag_services};
use taglink::{
    CharacteristicUpdate, FragmentError, Fragmenter, FragmentedTransport, MAX_MESSAGE_LEN,
    RequiredCharacteristics, TagCharacteristic,
};

fn message(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index * 7 % 256) as u8).collect()
}

#[rstest]
#[case(23, 0)]
#[case(23, 1)]
#[case(23, 300)]
#[case(185, 1000)]
#[case(512, MAX_MESSAGE_LEN)]
fn fragments_written_by_one_transport_reassemble_on_another(
    #[case] mtu: usize,
    #[case] len: usize,
) -> anyhow::Result<()> {
    let characteristics = RequiredCharacteristics::from_services(&tag_services())?;
    let sender_peripheral = FakePeripheral::new("AA:BB");
    let sender = FragmentedTransport::new(sender_peripheral.clone(), characteristics.clone(), mtu);
    let receiver = FragmentedTransport::new(FakePeripheral::new("CC:DD"), characteristics, mtu);

    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&received);
    let _subscription = receiver
        .responses()
        .subscribe_next(move |message: &Vec<u8>| sink.borrow_mut().push(message.clone()));

    let sent = message(len);
    let fragments = sender.send(&sent)?;
    let written = sender_peripheral.writes_to(TagCharacteristic::Command.uuid());
    assert_eq!(fragments, written.len());
    assert!(written.iter().all(|fragment| fragment.len() <= mtu - 3));

    for fragment in written {
        receiver.on_characteristic_updated(&CharacteristicUpdate::new(
            TagCharacteristic::Response.uuid(),
            fragment,
        ));
    }

    assert_eq!(vec![sent], *received.borrow());
    Ok(())
}

#[test]
fn largest_message_fits_and_one_more_byte_does_not() {
    assert!(Fragmenter::fragment(&message(MAX_MESSAGE_LEN), 23).is_ok());
    assert_matches!(
        Fragmenter::fragment(&message(MAX_MESSAGE_LEN + 1), 23),
        Err(FragmentError::MessageTooLarge { len }) if len == MAX_MESSAGE_LEN + 1
    );
}

#[test]
fn decoder_recovers_after_an_interleaved_message() -> anyhow::Result<()> {
    let first = Fragmenter::fragment(&message(60), 23)?;
    let second = Fragmenter::fragment(&message(10), 23)?;
    let mut decoder = Fragmenter::new();

    assert_eq!(None, decoder.decode_fragment(&first[0])?);
    assert_eq!(Some(message(10)), decoder.decode_fragment(&second[0])?);
    assert_matches!(
        decoder.decode_fragment(&first[1]),
        Err(FragmentError::NoMessageInProgress { .. })
    );
    Ok(())
}
