use utxo_wallet::bitcoin::{
    self, hashes::Hash, script::Instruction, secp256k1, sighash::SighashCache, Amount,
    EcdsaSighashType, Script, Transaction,
};
use utxo_wallet::{
    AddressType, BuildError, Builder, ChainParams, FeeRate, FinalizeError, SignedTransaction,
    TransactionSigner, UnsignedTransaction,
};
use utxo_wallet_testenv::{recipient, signer, spending_key, utxo};

fn build(
    params: ChainParams,
    address_type: AddressType,
    utxos: &[u64],
    amount: u64,
    rate: u64,
) -> anyhow::Result<UnsignedTransaction> {
    let spending = spending_key(address_type)?;
    let mut builder = Builder::new(params, spending.clone());
    builder
        .recipient(recipient(), Amount::from_sat(amount))
        .fee_rate(FeeRate::from_sat_per_vb_u64(rate));
    for (i, sat) in utxos.iter().enumerate() {
        builder.add_utxo(utxo(&spending, i as u8 + 1, 0, *sat));
    }
    Ok(builder.build()?)
}

async fn sign(unsigned: UnsignedTransaction) -> anyhow::Result<SignedTransaction> {
    let signatures = signer(1).sign(unsigned.signing_hashes()).await?;
    Ok(unsigned.into_finalizer().finalize(&signatures)?)
}

/// Check a DER + sighash-type signature against `digest` and fixture key 1.
fn verify(sig: &[u8], digest: [u8; 32]) -> anyhow::Result<()> {
    let sig = bitcoin::ecdsa::Signature::from_slice(sig)?;
    let secp = secp256k1::Secp256k1::verification_only();
    secp.verify_ecdsa(
        &secp256k1::Message::from_digest(digest),
        &sig.signature,
        &utxo_wallet_testenv::public_key(1).inner,
    )?;
    Ok(())
}

fn first_push(script: &Script) -> Vec<u8> {
    match script.instructions().next() {
        Some(Ok(Instruction::PushBytes(bytes))) => bytes.as_bytes().to_vec(),
        other => panic!("expected a push, got {other:?}"),
    }
}

#[tokio::test]
async fn test_p2wpkh() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin(),
        AddressType::P2wpkh,
        &[50_000, 30_000],
        60_000,
        10,
    )?;
    let utxos: Vec<_> = unsigned.inputs().map(|(utxo, _)| utxo.clone()).collect();
    let estimated = unsigned.estimated_vbytes();
    let signed = sign(unsigned).await?;
    let tx: &Transaction = signed.transaction();

    assert_eq!(signed.fee(), Amount::from_sat(2_080));
    assert_eq!(tx.output[1].value, Amount::from_sat(17_920));
    assert!((signed.vsize() as i64 - estimated as i64).abs() <= 1);

    let mut cache = SighashCache::new(tx);
    for (index, utxo) in utxos.iter().enumerate() {
        let input = &tx.input[index];
        assert!(input.script_sig.is_empty());
        assert_eq!(input.witness.len(), 2);
        let digest = cache.p2wpkh_signature_hash(
            index,
            &utxo.script_pubkey,
            utxo.amount,
            EcdsaSighashType::All,
        )?;
        verify(&input.witness[0], digest.to_byte_array())?;
    }
    Ok(())
}

#[tokio::test]
async fn test_p2pkh() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin(),
        AddressType::P2pkh,
        &[40_000, 40_000],
        50_000,
        3,
    )?;
    let spk = unsigned.spending_key().script_pubkey().clone();
    let signed = sign(unsigned).await?;
    let tx = signed.transaction();

    let cache = SighashCache::new(tx);
    for (index, input) in tx.input.iter().enumerate() {
        assert!(input.witness.is_empty());
        let digest = cache.legacy_signature_hash(index, &spk, 0x01)?;
        verify(&first_push(&input.script_sig), digest.to_byte_array())?;
    }
    Ok(())
}

#[tokio::test]
async fn test_bitcoin_cash_forkid() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin_cash(),
        AddressType::P2pkh,
        &[100_000],
        20_000,
        1,
    )?;
    let spk = unsigned.spending_key().script_pubkey().clone();
    let digest = unsigned.signing_hashes()[0];
    let legacy = SighashCache::new(unsigned.unsigned_tx())
        .legacy_signature_hash(0, &spk, 0x01)?
        .to_byte_array();
    assert_ne!(digest, legacy);

    let signed = sign(unsigned).await?;
    let sig = first_push(&signed.transaction().input[0].script_sig);
    assert_eq!(sig.last(), Some(&0x41));
    let secp = secp256k1::Secp256k1::verification_only();
    let der = secp256k1::ecdsa::Signature::from_der(&sig[..sig.len() - 1])?;
    secp.verify_ecdsa(
        &secp256k1::Message::from_digest(digest),
        &der,
        &utxo_wallet_testenv::public_key(1).inner,
    )?;
    Ok(())
}

#[tokio::test]
async fn test_p2sh_p2wpkh() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::litecoin(),
        AddressType::P2shP2wpkh,
        &[500_000],
        100_000,
        2,
    )?;
    let signed = sign(unsigned).await?;
    let input = &signed.transaction().input[0];
    let redeem = first_push(&input.script_sig);
    assert_eq!(redeem.len(), 22);
    assert_eq!(&redeem[..2], &[0x00, 0x14]);
    assert_eq!(input.witness.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_p2wsh_multisig() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin(),
        AddressType::P2wshMultisig,
        &[30_000, 30_000],
        45_000,
        5,
    )?;
    let utxos: Vec<_> = unsigned.inputs().map(|(utxo, _)| utxo.clone()).collect();
    let signed = sign(unsigned).await?;
    let tx = signed.transaction();

    let mut cache = SighashCache::new(tx);
    for (index, utxo) in utxos.iter().enumerate() {
        let witness = &tx.input[index].witness;
        assert_eq!(witness.len(), 3);
        assert!(witness[0].is_empty());
        let witness_script = Script::from_bytes(&witness[2]);
        assert_eq!(witness_script.to_p2wsh(), utxo.script_pubkey);
        let digest = cache.p2wsh_signature_hash(
            index,
            witness_script,
            utxo.amount,
            EcdsaSighashType::All,
        )?;
        verify(&witness[1], digest.to_byte_array())?;
    }
    Ok(())
}

#[tokio::test]
async fn test_finalize_is_deterministic() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin(),
        AddressType::P2wpkh,
        &[20_000, 20_000, 20_000],
        50_000,
        4,
    )?;
    let signatures = signer(1).sign(unsigned.signing_hashes()).await?;
    let finalizer = unsigned.into_finalizer();
    let a = finalizer.finalize(&signatures)?;
    let b = finalizer.finalize(&signatures)?;
    assert_eq!(a.to_bytes(), b.to_bytes());
    assert_eq!(a.txid(), a.transaction().compute_txid());
    assert_eq!(a.to_hex().len(), a.to_bytes().len() * 2);
    Ok(())
}

#[tokio::test]
async fn test_bad_signatures_are_rejected() -> anyhow::Result<()> {
    let unsigned = build(
        ChainParams::bitcoin(),
        AddressType::P2wpkh,
        &[20_000, 20_000],
        30_000,
        1,
    )?;
    let hashes = unsigned.signing_hashes().to_vec();
    let finalizer = unsigned.into_finalizer();

    let mut signatures = signer(1).sign(&hashes).await?;
    signatures.pop();
    assert!(matches!(
        finalizer.finalize(&signatures),
        Err(FinalizeError::SignatureCountMismatch {
            expected: 2,
            got: 1
        })
    ));

    let wrong_key = signer(9).sign(&hashes).await?;
    assert!(matches!(
        finalizer.finalize(&wrong_key),
        Err(FinalizeError::InvalidSignature { index: 0 })
    ));

    let swapped = {
        let mut sigs = signer(1).sign(&hashes).await?;
        sigs.swap(0, 1);
        sigs
    };
    assert!(finalizer.finalize(&swapped).is_err());
    Ok(())
}

#[test]
fn test_value_is_conserved() -> anyhow::Result<()> {
    let utxos = [12_345, 6_789, 100_000, 547, 33_333];
    for amount in [1_000, 10_000, 50_000, 120_000, 150_000] {
        for rate in [1, 7, 25] {
            let unsigned = match build(
                ChainParams::bitcoin(),
                AddressType::P2wpkh,
                &utxos,
                amount,
                rate,
            ) {
                Ok(unsigned) => unsigned,
                Err(e) => {
                    assert!(matches!(
                        e.downcast_ref::<BuildError>(),
                        Some(BuildError::InsufficientFunds { .. })
                    ));
                    continue;
                }
            };
            let outputs: Amount = unsigned.outputs().iter().map(|txo| txo.value).sum();
            assert_eq!(outputs + unsigned.fee(), unsigned.total_input());
            if let Some(change) = unsigned.change() {
                assert!(change.value >= ChainParams::bitcoin().dust_threshold);
            }
        }
    }
    Ok(())
}
